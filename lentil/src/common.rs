pub use log::{info, warn};

pub type Mat = nalgebra::DMatrix<f32>;
pub type DVec = nalgebra::DVector<f32>;
pub type CsrMat = nalgebra_sparse::CsrMatrix<f32>;
pub type CscMat = nalgebra_sparse::CscMatrix<f32>;

pub use crate::error::{Diagnostic, LentilError, Stage};
