use aliri_braid::braid;
use std::fmt;

/// Implements `Debug` and `Display` for a secret borrowed braid
///
/// Both print only the label. With the alternate flag, `Debug` reveals a
/// quoted prefix of at most `$reveal` characters (or the formatter width) and
/// `Display` reveals the whole secret.
macro_rules! redacted {
    ($ty:ty, $label:literal, $reveal:literal) => {
        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if !f.alternate() {
                    return f.write_str(concat!("***", $label, "***"));
                }

                let reveal = f.width().unwrap_or($reveal);
                write!(f, "\"{}\"", Prefix(&self.0, reveal))
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if f.alternate() {
                    f.write_str(&self.0)
                } else {
                    f.write_str(concat!("***", $label, "***"))
                }
            }
        }
    };
}

/// The first `.1` characters of a secret, with an ellipsis if any were cut
struct Prefix<'a>(&'a str, usize);

impl fmt::Display for Prefix<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.0.char_indices().nth(self.1) {
            Some((end, _)) => write!(f, "{}…", &self.0[..end]),
            None => f.write_str(self.0),
        }
    }
}

/// An AWS access key ID
#[braid(serde)]
pub struct AccessKeyId;

/// An AWS secret access key
#[braid(serde, debug = "owned", display = "owned")]
pub struct SecretAccessKey;

redacted!(SecretAccessKeyRef, "SECRET ACCESS KEY", 4);

/// An AWS session token issued alongside temporary credentials
#[braid(serde, debug = "owned", display = "owned")]
pub struct SessionToken;

redacted!(SessionTokenRef, "SESSION TOKEN", 8);

/// An OAuth2 bearer access token
#[braid(serde, debug = "owned", display = "owned")]
pub struct AccessToken;

redacted!(AccessTokenRef, "ACCESS TOKEN", 12);
