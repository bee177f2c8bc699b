use core::fmt;

/// The type of a value passed across the host/guest boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValType {
    /// Signed 32 bit integer.
    I32,
    /// Signed 64 bit integer.
    I64,
    /// Floating point 32 bit number.
    F32,
    /// Floating point 64 bit number.
    F64,
}

impl ValType {
    /// Returns the zero value of this type, used to pre-fill result slots.
    pub fn default_value(&self) -> Val {
        match self {
            ValType::I32 => Val::I32(0),
            ValType::I64 => Val::I64(0),
            ValType::F32 => Val::F32(0),
            ValType::F64 => Val::F64(0),
        }
    }
}

impl fmt::Display for ValType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValType::I32 => write!(f, "i32"),
            ValType::I64 => write!(f, "i64"),
            ValType::F32 => write!(f, "f32"),
            ValType::F64 => write!(f, "f64"),
        }
    }
}

/// Possible runtime values that guest code and host functions exchange.
///
/// Floats are stored as their raw bits so that `Val` can be compared and
/// hashed without NaN surprises.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Val {
    /// A 32-bit integer.
    I32(i32),
    /// A 64-bit integer.
    I64(i64),
    /// A 32-bit float, as raw bits.
    F32(u32),
    /// A 64-bit float, as raw bits.
    F64(u64),
}

impl Val {
    /// Returns the corresponding [`ValType`] for this `Val`.
    pub fn ty(&self) -> ValType {
        match self {
            Val::I32(_) => ValType::I32,
            Val::I64(_) => ValType::I64,
            Val::F32(_) => ValType::F32,
            Val::F64(_) => ValType::F64,
        }
    }

    /// Attempt to access the underlying `i32`, returning `None` if this is a
    /// different kind of value.
    pub fn i32(&self) -> Option<i32> {
        match self {
            Val::I32(v) => Some(*v),
            _ => None,
        }
    }

    /// Attempt to access the underlying `i64`, returning `None` if this is a
    /// different kind of value.
    pub fn i64(&self) -> Option<i64> {
        match self {
            Val::I64(v) => Some(*v),
            _ => None,
        }
    }

    /// Attempt to access the underlying `f32`, returning `None` if this is a
    /// different kind of value.
    pub fn f32(&self) -> Option<f32> {
        match self {
            Val::F32(bits) => Some(f32::from_bits(*bits)),
            _ => None,
        }
    }

    /// Attempt to access the underlying `f64`, returning `None` if this is a
    /// different kind of value.
    pub fn f64(&self) -> Option<f64> {
        match self {
            Val::F64(bits) => Some(f64::from_bits(*bits)),
            _ => None,
        }
    }

    /// Returns the underlying `i32`, panicking if it's the wrong type.
    pub fn unwrap_i32(&self) -> i32 {
        self.i32().expect("expected i32")
    }

    /// Returns the underlying `i64`, panicking if it's the wrong type.
    pub fn unwrap_i64(&self) -> i64 {
        self.i64().expect("expected i64")
    }
}

impl From<i32> for Val {
    fn from(val: i32) -> Val {
        Val::I32(val)
    }
}

impl From<i64> for Val {
    fn from(val: i64) -> Val {
        Val::I64(val)
    }
}

impl From<f32> for Val {
    fn from(val: f32) -> Val {
        Val::F32(val.to_bits())
    }
}

impl From<f64> for Val {
    fn from(val: f64) -> Val {
        Val::F64(val.to_bits())
    }
}

/// The signature of a function: its parameter and result types.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct FuncType {
    params: Box<[ValType]>,
    results: Box<[ValType]>,
}

impl FuncType {
    /// Creates a new function type from the given parameters and results.
    pub fn new(
        params: impl IntoIterator<Item = ValType>,
        results: impl IntoIterator<Item = ValType>,
    ) -> FuncType {
        FuncType {
            params: params.into_iter().collect(),
            results: results.into_iter().collect(),
        }
    }

    /// Returns the list of parameter types for this function.
    pub fn params(&self) -> &[ValType] {
        &self.params
    }

    /// Returns the list of result types for this function.
    pub fn results(&self) -> &[ValType] {
        &self.results
    }

    /// Default-initialized result slots for a call of this type.
    pub(crate) fn result_slots(&self) -> Vec<Val> {
        self.results.iter().map(|ty| ty.default_value()).collect()
    }
}

impl fmt::Display for FuncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(func")?;
        if !self.params.is_empty() {
            write!(f, " (param")?;
            for ty in self.params.iter() {
                write!(f, " {ty}")?;
            }
            write!(f, ")")?;
        }
        if !self.results.is_empty() {
            write!(f, " (result")?;
            for ty in self.results.iter() {
                write!(f, " {ty}")?;
            }
            write!(f, ")")?;
        }
        write!(f, ")")
    }
}

/// Checks that `vals` lines up with `tys`, naming the slots `desc` in the
/// error message.
pub(crate) fn typecheck(desc: &str, tys: &[ValType], vals: &[Val]) -> anyhow::Result<()> {
    anyhow::ensure!(
        tys.len() == vals.len(),
        "expected {} {desc}, got {}",
        tys.len(),
        vals.len()
    );
    for (i, (ty, val)) in tys.iter().zip(vals).enumerate() {
        anyhow::ensure!(
            *ty == val.ty(),
            "{desc} {i}: expected {ty}, found {}",
            val.ty()
        );
    }
    Ok(())
}
