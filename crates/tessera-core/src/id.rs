//! Opaque identifiers and secrets.
//!
//! Every persisted entity (user, event, access) is identified by a
//! cuid-shaped string: a `c` followed by 24 lowercase base-32 characters.
//! Ids are generated locally and treated as globally unique; collisions are
//! not checked beyond the storage layer's unique indexes.

use std::fmt;
use std::str::FromStr;

use rand::RngCore as _;
use snafu::Snafu;

const ID_PREFIX: char = 'c';
const ID_RANDOM_BYTES: usize = 15;
const ID_LEN: usize = 25;

/// Access tokens get more entropy than ids since they are bearer secrets.
const TOKEN_RANDOM_BYTES: usize = 20;

#[derive(Debug, Snafu)]
#[snafu(display("Malformed identifier `{value}`"))]
pub struct InvalidId {
    pub value: String,
}

fn generate_raw(random_bytes: usize) -> String {
    let mut bytes = vec![0u8; random_bytes];
    rand::rng().fill_bytes(&mut bytes);
    let mut out = String::with_capacity(1 + 2 * random_bytes);
    out.push(ID_PREFIX);
    out.push_str(&data_encoding::BASE32_DNSSEC.encode(&bytes));
    out
}

/// Generate a bearer token for an access or a session.
pub fn generate_token() -> String {
    generate_raw(TOKEN_RANDOM_BYTES)
}

fn check_id(s: &str) -> bool {
    s.len() == ID_LEN
        && s.starts_with(ID_PREFIX)
        && s[1..]
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
}

macro_rules! define_id_type {
    (
        $(#[$outer:meta])*
        struct $t:tt
    ) => {
        $(#[$outer])*
        #[derive(
            Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash,
            ::serde::Serialize, ::serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $t(String);

        impl $t {
            pub fn generate() -> Self {
                Self(generate_raw(ID_RANDOM_BYTES))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $t {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $t {
            type Err = InvalidId;

            fn from_str(s: &str) -> Result<$t, Self::Err> {
                if !check_id(s) {
                    return Err(InvalidId {
                        value: s.to_owned(),
                    });
                }
                Ok(Self(s.to_owned()))
            }
        }

        impl From<$t> for String {
            fn from(value: $t) -> Self {
                value.0
            }
        }
    };
}

define_id_type!(
    /// Identifies one user across the whole node; the username→id mapping
    /// lives in the users index.
    struct UserId
);

define_id_type!(
    /// Identifies one event within one user's event store. History rows keep
    /// the id of their head event in `head_id` instead of reusing it.
    struct EventId
);

define_id_type!(
    /// Identifies an access (capability token record).
    struct AccessId
);
