//! Mark state shared by the major and minor collectors.

mod bitmap;

pub use bitmap::{AccessMode, Atomic, Color, MarkBitmap, MarkingMode, NonAtomic};

/// Which collector a bitmap or marking cycle belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Generation {
    /// Full-heap marking.
    Major,
    /// Young generation marking.
    Minor,
}

impl Generation {
    /// Name used in logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Major => "major",
            Self::Minor => "minor",
        }
    }
}
