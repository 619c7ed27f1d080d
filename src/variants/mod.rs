pub(crate) mod yinyang;

pub use yinyang::{YinyangBuffers, YinyangSizes};
