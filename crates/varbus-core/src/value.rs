//! Typed variable values, numeric coercion, and format rendering.
//!
//! Every variable owns exactly one [`VarValue`]. The variant is fixed at
//! creation time: writes never change a variable's type, they coerce the
//! incoming value into it. Numeric coercion is range-checked for every
//! int/uint width pair; string and blob storage has a fixed capacity equal
//! to the length declared at creation.

use crate::status::StatusCode;

/// Type tag of a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VarType {
    /// 16-bit signed integer.
    Int16  = 1,
    /// 16-bit unsigned integer.
    UInt16 = 2,
    /// 32-bit signed integer.
    Int32  = 3,
    /// 32-bit unsigned integer.
    UInt32 = 4,
    /// 32-bit IEEE float.
    Float  = 5,
    /// Length-prefixed UTF-8 string with fixed capacity.
    Str    = 6,
    /// Length-prefixed opaque blob with fixed capacity.
    Blob   = 7,
}

impl VarType {
    /// Parses a type from its wire tag.
    #[must_use]
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Int16),
            2 => Some(Self::UInt16),
            3 => Some(Self::Int32),
            4 => Some(Self::UInt32),
            5 => Some(Self::Float),
            6 => Some(Self::Str),
            7 => Some(Self::Blob),
            _ => None,
        }
    }

    /// Wire tag for this type.
    #[must_use]
    pub const fn tag(self) -> u8 {
        self as u8
    }

    /// Returns `true` for the four integer widths and float.
    #[must_use]
    pub const fn is_numeric(self) -> bool {
        !matches!(self, Self::Str | Self::Blob)
    }

    /// Short stable name for logs and diagnostics.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Int16 => "int16",
            Self::UInt16 => "uint16",
            Self::Int32 => "int32",
            Self::UInt32 => "uint32",
            Self::Float => "float",
            Self::Str => "str",
            Self::Blob => "blob",
        }
    }
}

/// A typed value: one variant representation plus an explicit length for
/// the variable-size types.
#[derive(Debug, Clone, PartialEq)]
pub enum VarValue {
    /// 16-bit signed integer.
    Int16(i16),
    /// 16-bit unsigned integer.
    UInt16(u16),
    /// 32-bit signed integer.
    Int32(i32),
    /// 32-bit unsigned integer.
    UInt32(u32),
    /// 32-bit IEEE float.
    Float(f32),
    /// UTF-8 string.
    Str(String),
    /// Opaque blob.
    Blob(Vec<u8>),
}

impl VarValue {
    /// The type tag of this value.
    #[must_use]
    pub const fn var_type(&self) -> VarType {
        match self {
            Self::Int16(_) => VarType::Int16,
            Self::UInt16(_) => VarType::UInt16,
            Self::Int32(_) => VarType::Int32,
            Self::UInt32(_) => VarType::UInt32,
            Self::Float(_) => VarType::Float,
            Self::Str(_) => VarType::Str,
            Self::Blob(_) => VarType::Blob,
        }
    }

    /// Length of the value in bytes as stored.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Int16(_) | Self::UInt16(_) => 2,
            Self::Int32(_) | Self::UInt32(_) | Self::Float(_) => 4,
            Self::Str(s) => s.len(),
            Self::Blob(b) => b.len(),
        }
    }

    /// Returns `true` for a zero-length string or blob.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Str(s) if s.is_empty()) || matches!(self, Self::Blob(b) if b.is_empty())
    }

    /// Byte-level equality.
    ///
    /// This is the idempotent-write check: a write whose encoded bytes are
    /// identical to the current value is reported as `AlreadyCurrent` and
    /// suppresses notification fan-out. Floats compare by bit pattern, so a
    /// NaN rewrite of the same NaN is idempotent too.
    #[must_use]
    pub fn same_bytes(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Int16(a), Self::Int16(b)) => a == b,
            (Self::UInt16(a), Self::UInt16(b)) => a == b,
            (Self::Int32(a), Self::Int32(b)) => a == b,
            (Self::UInt32(a), Self::UInt32(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Blob(a), Self::Blob(b)) => a == b,
            _ => false,
        }
    }

    /// Widens any integer variant to `i64`; `None` for float/str/blob.
    const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int16(v) => Some(*v as i64),
            Self::UInt16(v) => Some(*v as i64),
            Self::Int32(v) => Some(*v as i64),
            Self::UInt32(v) => Some(*v as i64),
            _ => None,
        }
    }

    /// Coerces this value into the destination type.
    ///
    /// A numeric write is accepted iff the source value fits within the
    /// destination type's representable range; out-of-range values fail
    /// [`StatusCode::OutOfRange`]. Integer-to-float widening is accepted;
    /// float-to-integer narrowing is not (lossy, fails
    /// [`StatusCode::NotSupported`]). String and blob values only coerce to
    /// their own type.
    ///
    /// # Errors
    ///
    /// Returns the wire status code describing the rejected coercion.
    pub fn coerce_into(self, dst: VarType) -> Result<Self, StatusCode> {
        if self.var_type() == dst {
            return Ok(self);
        }
        match dst {
            VarType::Int16 | VarType::UInt16 | VarType::Int32 | VarType::UInt32 => {
                let Some(wide) = self.as_i64() else {
                    return Err(StatusCode::NotSupported);
                };
                match dst {
                    VarType::Int16 => i16::try_from(wide)
                        .map(Self::Int16)
                        .map_err(|_| StatusCode::OutOfRange),
                    VarType::UInt16 => u16::try_from(wide)
                        .map(Self::UInt16)
                        .map_err(|_| StatusCode::OutOfRange),
                    VarType::Int32 => i32::try_from(wide)
                        .map(Self::Int32)
                        .map_err(|_| StatusCode::OutOfRange),
                    VarType::UInt32 => u32::try_from(wide)
                        .map(Self::UInt32)
                        .map_err(|_| StatusCode::OutOfRange),
                    _ => unreachable!(),
                }
            }
            VarType::Float => match self.as_i64() {
                // Integer widths all fit a f32's range (with rounding).
                #[allow(clippy::cast_precision_loss)]
                Some(wide) => Ok(Self::Float(wide as f32)),
                None => Err(StatusCode::NotSupported),
            },
            VarType::Str | VarType::Blob => Err(StatusCode::NotSupported),
        }
    }

    /// Renders the value through a printf-style format specifier.
    ///
    /// Supported directives: `%d` `%u` `%x` `%X` `%o` `%f` `%e` `%s`, with
    /// an optional zero-pad flag, field width, and (for `%f`/`%e`) a
    /// precision, e.g. `%08X` or `%.2f`. An empty or unparsable specifier
    /// falls back to the default rendering for the type.
    #[must_use]
    pub fn render(&self, spec: &str) -> String {
        match FormatSpec::parse(spec) {
            Some(fmt) => fmt.apply(self),
            None => self.render_default(),
        }
    }

    fn render_default(&self) -> String {
        match self {
            Self::Int16(v) => v.to_string(),
            Self::UInt16(v) => v.to_string(),
            Self::Int32(v) => v.to_string(),
            Self::UInt32(v) => v.to_string(),
            Self::Float(v) => v.to_string(),
            Self::Str(s) => s.clone(),
            Self::Blob(b) => {
                let mut out = String::with_capacity(b.len() * 2);
                for byte in b {
                    out.push_str(&format!("{byte:02x}"));
                }
                out
            }
        }
    }
}

/// A parsed `%`-directive: `%[0][width][.precision]<conv>`.
struct FormatSpec {
    zero_pad: bool,
    width: usize,
    precision: Option<usize>,
    conv: char,
}

impl FormatSpec {
    fn parse(spec: &str) -> Option<Self> {
        let rest = spec.strip_prefix('%')?;
        let mut chars = rest.chars().peekable();
        let zero_pad = chars.peek() == Some(&'0');
        if zero_pad {
            chars.next();
        }
        let mut width = 0usize;
        while let Some(c) = chars.peek() {
            let Some(d) = c.to_digit(10) else { break };
            width = width.saturating_mul(10).saturating_add(d as usize);
            chars.next();
        }
        let mut precision = None;
        if chars.peek() == Some(&'.') {
            chars.next();
            let mut p = 0usize;
            while let Some(c) = chars.peek() {
                let Some(d) = c.to_digit(10) else { break };
                p = p.saturating_mul(10).saturating_add(d as usize);
                chars.next();
            }
            precision = Some(p);
        }
        let conv = chars.next()?;
        if chars.next().is_some() {
            return None;
        }
        if !matches!(conv, 'd' | 'u' | 'x' | 'X' | 'o' | 'f' | 'e' | 's') {
            return None;
        }
        Some(Self {
            zero_pad,
            width,
            precision,
            conv,
        })
    }

    fn apply(&self, value: &VarValue) -> String {
        let body = match (self.conv, value) {
            ('x', _) => value.as_i64().map(|v| format!("{v:x}")),
            ('X', _) => value.as_i64().map(|v| format!("{v:X}")),
            ('o', _) => value.as_i64().map(|v| format!("{v:o}")),
            ('d' | 'u', _) => value.as_i64().map(|v| v.to_string()),
            ('f', VarValue::Float(v)) => {
                let prec = self.precision.unwrap_or(6);
                Some(format!("{v:.prec$}"))
            }
            ('e', VarValue::Float(v)) => Some(format!("{v:e}")),
            ('s', VarValue::Str(s)) => Some(s.clone()),
            _ => None,
        };
        let body = body.unwrap_or_else(|| value.render_default());
        if body.len() >= self.width {
            return body;
        }
        let pad = if self.zero_pad { '0' } else { ' ' };
        let mut out = String::with_capacity(self.width);
        for _ in 0..self.width - body.len() {
            out.push(pad);
        }
        out.push_str(&body);
        out
    }
}
