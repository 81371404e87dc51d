//! Random-byte source, supplied by the host at `Session::open`.
//!
//! Replaces the original `Sky_randfn_t rand_bytes` function pointer. Used
//! only to fill the per-message AES-CBC IV in [`crate::codec`]. Modeled as
//! a fallible trait (rather than `rand_core::RngCore` directly) because the
//! original signature can report failure; failure escalates to
//! [`crate::error::Error::ResourceUnavailable`], never silently ignored.

use crate::error::{Error, Result};

/// A host-supplied source of random bytes.
pub trait RandomSource {
    /// Fill `buf` with random bytes, or fail.
    fn fill(&mut self, buf: &mut [u8]) -> Result<()>;
}

/// Adapt any `rand_core::RngCore` into a [`RandomSource`].
impl<T: rand_core::RngCore> RandomSource for T {
    fn fill(&mut self, buf: &mut [u8]) -> Result<()> {
        self.try_fill_bytes(buf).map_err(|_| Error::ResourceUnavailable)
    }
}

#[cfg(any(test, feature = "mocks"))]
pub mod mock {
    use super::*;

    /// A source that always fails, for exercising the failure path.
    pub struct FailingRandom;

    impl RandomSource for FailingRandom {
        fn fill(&mut self, _buf: &mut [u8]) -> Result<()> {
            Err(Error::ResourceUnavailable)
        }
    }

    /// A source that cycles through a fixed byte pattern, for deterministic tests.
    pub struct PatternRandom {
        pub pattern: &'static [u8],
        pub pos: usize,
    }

    impl PatternRandom {
        pub fn new(pattern: &'static [u8]) -> Self {
            PatternRandom { pattern, pos: 0 }
        }
    }

    impl RandomSource for PatternRandom {
        fn fill(&mut self, buf: &mut [u8]) -> Result<()> {
            for b in buf.iter_mut() {
                *b = self.pattern[self.pos % self.pattern.len()];
                self.pos += 1;
            }
            Ok(())
        }
    }
}
