/// Declare an enum of SCPI mnemonics.
///
/// Generates `as_scpi`, `Display`, a case-insensitive `FromStr` (for
/// parsing query replies) and a `clap::ValueEnum` derive so the same type
/// can be used from the command line.
macro_rules! scpi_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $scpi:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
        $vis enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_scpi(self) -> &'static str {
                match self {
                    $( $name::$variant => $scpi ),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_scpi())
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::error::VisaError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let s = s.trim();
                $(
                    if s.eq_ignore_ascii_case($scpi) {
                        return Ok($name::$variant);
                    }
                )+
                Err($crate::error::VisaError::InvalidOption {
                    what: stringify!($name).to_string(),
                    value: s.to_string(),
                    options: vec![$($scpi.to_string()),+],
                })
            }
        }
    };
}
