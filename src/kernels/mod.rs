//! Standard kernel library

pub mod calculate;

pub use calculate::Calculate;

use crate::kernel::Library;
use crate::transform::{ConstantFolder, DeadInputRemover, ExpressionFuser, Simplifier};

/// Register the standard transformers and kernels in a library.
pub fn register_standard_library(library: &mut Library) {
    library.register_transformer(Box::new(Simplifier));
    library.register_transformer(Box::new(ConstantFolder));
    library.register_transformer(Box::new(ExpressionFuser));
    library.register_transformer(Box::new(DeadInputRemover));
    calculate::register(library);
}

/// Build a library with the standard transformers and kernels.
pub fn standard_library() -> Library {
    let mut library = Library::new();
    register_standard_library(&mut library);
    library
}
