//! Macros for defining fixed-width address types.

/// Macro to define a 32-bit address newtype with a human-readable label.
///
/// This generates a newtype wrapper around `u32` with:
/// - A `LABEL` constant used in error messages
/// - `from_u32()` / `as_u32()` for the raw numeric value
/// - `to_wire()` / `from_wire()` for the network-order octets
/// - `parse()` from dotted-quad text
/// - `Display`, `FromStr`, `Serialize` and `Deserialize` implementations
///
/// # Example
///
/// ```ignore
/// define_addr!(ServiceKey, "service key");
///
/// let key: ServiceKey = "10.96.0.10".parse()?;
/// assert_eq!(key.to_wire(), [10, 96, 0, 10]);
/// ```
#[macro_export]
macro_rules! define_addr {
    ($name:ident, $label:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u32);

        impl $name {
            /// Label used in error messages.
            pub const LABEL: &'static str = $label;

            /// Creates a value from its numeric (host order) representation.
            #[must_use]
            pub const fn from_u32(raw: u32) -> Self {
                Self(raw)
            }

            /// Returns the numeric (host order) representation.
            #[must_use]
            pub const fn as_u32(&self) -> u32 {
                self.0
            }

            /// Returns the address as an [`std::net::Ipv4Addr`].
            #[must_use]
            pub fn ipv4(&self) -> std::net::Ipv4Addr {
                std::net::Ipv4Addr::from(self.0)
            }

            /// Returns the octets in network byte order.
            #[must_use]
            pub const fn to_wire(&self) -> [u8; 4] {
                self.0.to_be_bytes()
            }

            /// Creates a value from octets in network byte order.
            #[must_use]
            pub const fn from_wire(octets: [u8; 4]) -> Self {
                Self(u32::from_be_bytes(octets))
            }

            /// Parses a dotted-quad IPv4 string.
            pub fn parse(s: &str) -> Result<Self, $crate::AddrError> {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    return Err($crate::AddrError::Empty { label: Self::LABEL });
                }

                trimmed
                    .parse::<std::net::Ipv4Addr>()
                    .map(Self::from)
                    .map_err(|_| $crate::AddrError::NotIpv4 {
                        label: Self::LABEL,
                        input: s.to_string(),
                    })
            }
        }

        impl From<std::net::Ipv4Addr> for $name {
            fn from(addr: std::net::Ipv4Addr) -> Self {
                Self(u32::from(addr))
            }
        }

        impl From<$name> for std::net::Ipv4Addr {
            fn from(value: $name) -> Self {
                value.ipv4()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.ipv4())
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::AddrError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.collect_str(self)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::parse(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}
