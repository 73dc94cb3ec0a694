//! Passphrase handling for transport encryption.

use std::fmt;

use zeroize::{Zeroize, ZeroizeOnDrop};

/// Shown instead of the secret in any Debug output.
const REDACTED: &str = "<passphrase redacted>";

/// A passphrase held only as long as a transfer needs it. The backing
/// memory is zeroed when the value drops; Debug never prints it. It is fed
/// to external tools over a pipe, never on an argument vector.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Passphrase(String);

impl Passphrase {
    pub fn new(secret: String) -> Self {
        Self(secret)
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl PartialEq for Passphrase {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for Passphrase {}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_never_prints_the_secret() {
        let secret = Passphrase::new("hunter2".to_string());
        let rendered = format!("{secret:?}");
        assert!(!rendered.contains("hunter2"));
        assert_eq!(rendered, REDACTED);
    }

    #[test]
    fn equality_compares_contents() {
        let a = Passphrase::new("same".to_string());
        let b = Passphrase::new("same".to_string());
        let c = Passphrase::new("different".to_string());
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
