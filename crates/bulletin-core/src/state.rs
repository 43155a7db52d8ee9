//! Integer wire encoding for record state enums.

/// Implements `u8` conversions for a fieldless state enum so serde can
/// encode it as its stable numeric discriminant.
macro_rules! numeric_state {
    ($ty:ident { $($variant:ident = $code:literal),+ $(,)? }) => {
        impl From<$ty> for u8 {
            fn from(state: $ty) -> u8 {
                match state {
                    $($ty::$variant => $code,)+
                }
            }
        }

        impl TryFrom<u8> for $ty {
            type Error = String;

            fn try_from(code: u8) -> Result<Self, Self::Error> {
                match code {
                    $($code => Ok($ty::$variant),)+
                    other => Err(format!("unknown {} code {other}", stringify!($ty))),
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self {
                    $($ty::$variant => f.write_str(stringify!($variant)),)+
                }
            }
        }
    };
}

pub(crate) use numeric_state;
