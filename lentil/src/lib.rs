pub mod annotation;
pub mod batched_pca;
pub mod cluster;
pub mod common;
pub mod community;
pub mod config;
pub mod embedding;
pub mod error;
pub mod expression;
pub mod input;
pub mod marker;
pub mod output;
pub mod patterns;
pub mod pharmacology;
pub mod pipeline;
pub mod qc;
pub mod reference;
pub mod regress;
pub mod run;
pub mod selectivity;
pub mod tsne;
pub mod umap_layout;
