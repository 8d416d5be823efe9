//! Model of the scripting host the callbacks live in.
//!
//! A host function is called in list context: it receives a flat list of
//! scalars and returns a list of dynamically typed values. Arrays cross the
//! boundary only as references.

/// A dynamically typed host value.
#[derive(Clone, Debug, PartialEq)]
pub enum HostValue {
    Undef,
    Int(i64),
    Float(f64),
    Str(String),
    /// Reference to an array of values.
    ArrayRef(Vec<HostValue>),
}

impl HostValue {
    /// Builds a reference to an array of floats.
    pub fn array<I>(values: I) -> HostValue
    where
        I: IntoIterator<Item = f64>,
    {
        HostValue::ArrayRef(values.into_iter().map(HostValue::Float).collect())
    }

    /// Builds a reference to an array of array references, one per row.
    pub fn matrix<R, I>(rows: R) -> HostValue
    where
        R: IntoIterator<Item = I>,
        I: IntoIterator<Item = f64>,
    {
        HostValue::ArrayRef(rows.into_iter().map(HostValue::array).collect())
    }

    /// Name of the value's type, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            HostValue::Undef => "undef",
            HostValue::Int(_) => "integer",
            HostValue::Float(_) => "float",
            HostValue::Str(_) => "string",
            HostValue::ArrayRef(_) => "array reference",
        }
    }

    pub fn is_string(&self) -> bool {
        matches!(self, HostValue::Str(_))
    }

    /// The value as a number, if it is an integer or a float.
    pub fn as_number(&self) -> Option<f64> {
        match *self {
            HostValue::Int(i) => Some(i as f64),
            HostValue::Float(x) => Some(x),
            _ => None,
        }
    }

    /// Numifies the value without complaint, as the host does in numeric
    /// context: strings are parsed (0 if they don't parse), undef is 0, and
    /// array references are not numbers at all.
    pub fn to_number(&self) -> f64 {
        match self {
            HostValue::Undef => 0.,
            HostValue::Int(i) => *i as f64,
            HostValue::Float(x) => *x,
            HostValue::Str(s) => s.trim().parse().unwrap_or(0.),
            HostValue::ArrayRef(_) => f64::NAN,
        }
    }

    /// Elements of the referenced array, if this is an array reference.
    pub fn as_array(&self) -> Option<&[HostValue]> {
        match self {
            HostValue::ArrayRef(items) => Some(items),
            _ => None,
        }
    }
}

impl From<f64> for HostValue {
    fn from(x: f64) -> HostValue {
        HostValue::Float(x)
    }
}

impl From<i64> for HostValue {
    fn from(i: i64) -> HostValue {
        HostValue::Int(i)
    }
}

impl From<&str> for HostValue {
    fn from(s: &str) -> HostValue {
        HostValue::Str(s.to_owned())
    }
}

impl From<String> for HostValue {
    fn from(s: String) -> HostValue {
        HostValue::Str(s)
    }
}

impl From<Vec<HostValue>> for HostValue {
    fn from(items: Vec<HostValue>) -> HostValue {
        HostValue::ArrayRef(items)
    }
}

/// A function living in the host.
pub trait HostFunction {
    /// Calls the function in list context.
    fn call(&mut self, args: &[HostValue]) -> Vec<HostValue>;
}

impl<F> HostFunction for F
where
    F: FnMut(&[HostValue]) -> Vec<HostValue>,
{
    fn call(&mut self, args: &[HostValue]) -> Vec<HostValue> {
        self(args)
    }
}
