use fnv::FnvHashMap as HashMap;
use lentil::annotation::*;
use lentil::common::*;
use lentil::config::*;
use lentil::expression::ExpressionContainer;
use lentil::input::attach_labels;
use lentil::output::write_outputs;
use lentil::pharmacology::{score_drug_responses, DrugResponseScores};
use lentil::pipeline::run_pipeline;
use lentil::qc::{detection_counts, filter_cells_and_genes};
use lentil::reference::*;
use lentil::regress::regress_and_scale;
use lentil::selectivity::classify_selectivity;
use matrix_util::parquet::peek_parquet_field_names;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Poisson};

const N_PER_GROUP: usize = 50;
const N_GROUPS: usize = 3;
const N_CELLS: usize = N_PER_GROUP * N_GROUPS;
const N_FILLER: usize = 30;

/// group-specific programs plus a few receptors and markers
fn synthetic_container(seed: u64) -> ExpressionContainer {
    let mut genes: Vec<Box<str>> = (0..N_FILLER)
        .map(|j| format!("Gene{}", j).into_boxed_str())
        .collect();
    for g in ["Htr1a", "Drd1", "Chrm1", "Drd2", "Snap25", "Gad1", "mt-Nd1", "Rare1"] {
        genes.push(g.into());
    }
    let cells: Vec<Box<str>> = (0..N_CELLS)
        .map(|i| format!("cell{:03}", i).into_boxed_str())
        .collect();

    let mut rng = StdRng::seed_from_u64(seed);
    let mut triplets = vec![];
    for i in 0..N_CELLS {
        let group = i / N_PER_GROUP;
        for (j, gene) in genes.iter().enumerate() {
            let rate = match gene.as_ref() {
                "Htr1a" => if group == 0 { 8. } else { 1. },
                "Drd1" => if group == 1 { 8. } else { 1. },
                "Chrm1" => if group == 2 { 8. } else { 1. },
                "Drd2" => 3.,
                "Snap25" | "Gad1" => 2.,
                "mt-Nd1" => 4.,
                // expressed by a single cell
                "Rare1" => if i == 0 { 5. } else { 0. },
                _ => if j / 10 == group { 6. } else { 0.5 },
            };
            if rate <= 0. {
                continue;
            }
            let x: f64 = Poisson::new(rate).unwrap().sample(&mut rng);
            if x > 0. {
                triplets.push((i, j, x as f32));
            }
        }
    }
    ExpressionContainer::from_triplets(cells, genes, &triplets).unwrap()
}

fn reference_tables() -> ReferenceTables {
    let affinity = AffinityMatrix::new(
        vec!["Clozapine".into(), "Haloperidol".into(), "Olanzapine".into()],
        vec![
            "HTR1A".into(),
            "DRD1".into(),
            "CHRM1".into(),
            "DRD2".into(),
        ],
        vec![
            // clozapine
            Some(0.05),
            Some(1.0),
            Some(0.5),
            Some(2.0),
            // haloperidol: no Gq affinity
            Some(5.0),
            Some(0.5),
            None,
            Some(0.2),
            // olanzapine
            Some(3.0),
            Some(0.8),
            Some(0.4),
            Some(0.6),
        ],
    )
    .unwrap();
    let types = ReceptorTypeTable::new([
        ("HTR1A", GProtein::Gi),
        ("DRD1", GProtein::Gs),
        ("CHRM1", GProtein::Gq),
        ("DRD2", GProtein::Gi),
    ]);
    ReferenceTables::new(affinity, types)
}

fn small_params() -> PipelineParams {
    let mut params = PipelineParams {
        qc: QcParams {
            min_genes_per_cell: 5,
            max_genes_per_cell: 1000,
            min_cells_per_gene: 3,
        },
        pca: PcaParams {
            n_components: 5,
            train_ratio: 0.5,
            n_batches: 4,
            ..Default::default()
        },
        embedding: EmbeddingParams {
            tsne_n_pcs: 5,
            tsne_perplexity: 10.,
            tsne_iter: 250,
            kmeans_k: 3,
            kmeans_n_init: 3,
            n_neighbors: 10,
            knn_n_pcs: 5,
            umap_epochs: Some(50),
            ..Default::default()
        },
        pharmacology: PharmacologyParams {
            gpcr_panel: vec![
                "HTR1A".into(),
                "DRD1".into(),
                "CHRM1".into(),
                "DRD2".into(),
                "ADRB2".into(),
            ],
            ..Default::default()
        },
        cell_type_markers: vec!["SNAP25".into(), "GAD1".into(), "OLIG2".into()],
        ..Default::default()
    };
    params.normalize_names();
    params
}

fn kind_of(err: &anyhow::Error) -> Option<&LentilError> {
    err.downcast_ref::<LentilError>()
}

#[test]
fn full_run_keeps_matrix_and_annotations_aligned() {
    let params = small_params();
    let out = run_pipeline(synthetic_container(0), &reference_tables(), &params).unwrap();

    let data = &out.data;
    data.check_integrity(Stage::Output).unwrap();
    assert_eq!(data.scaled().map(|x| x.shape()), Some((data.num_cells(), data.num_genes())));
    assert_eq!(out.pca.embedding.nrows(), data.num_cells());
    assert_eq!(out.pca.embedding.ncols(), 5);
    assert_eq!(out.pca.basis.components.nrows(), data.num_genes());
    assert_eq!(out.embedding.tsne.nrows(), data.num_cells());
    assert_eq!(out.embedding.umap.nrows(), data.num_cells());
    assert_eq!(out.snapshot.cells(), data.cells());
    assert_eq!(out.scores.cells.as_slice(), data.cells());
    for (key, column) in data.annotations.iter() {
        assert_eq!(column.len(), data.num_cells(), "annotation {}", key);
    }

    // the single-cell gene is gone
    assert!(data.gene_position("RARE1").is_none());
    assert_eq!(out.qc.genes_after, data.num_genes());

    for algorithm in [ClusterAlgorithm::KMeans, ClusterAlgorithm::Louvain, ClusterAlgorithm::Leiden] {
        assert!(data.annotations.categorical(&AnnotationKey::Cluster(algorithm)).is_some());
    }
    let kmeans = &out.embedding.kmeans.labels;
    for g in 0..N_GROUPS {
        let block = &kmeans[g * N_PER_GROUP..(g + 1) * N_PER_GROUP];
        assert!(block.iter().all(|&l| l == block[0]));
    }
}

#[test]
fn qc_bounds_hold_after_filtering() {
    let params = small_params();
    let (data, report) = filter_cells_and_genes(synthetic_container(1), &params.qc).unwrap();
    data.check_integrity(Stage::Qc).unwrap();
    assert_eq!(report.cells_after, data.num_cells());

    let (per_cell, per_gene) = detection_counts(data.counts().unwrap());
    assert!(per_cell
        .iter()
        .all(|&n| n >= params.qc.min_genes_per_cell && n <= params.qc.max_genes_per_cell));
    assert!(per_gene.iter().all(|&n| n >= params.qc.min_cells_per_gene));

    let n_genes = data
        .annotations
        .numeric(&AnnotationKey::Qc(QcMetric::GenesDetected))
        .unwrap();
    assert_eq!(n_genes.len(), data.num_cells());
}

#[test]
fn four_cells_three_genes_drops_low_coverage_gene() {
    let data = ExpressionContainer::from_triplets(
        vec!["a".into(), "b".into(), "c".into(), "d".into()],
        vec!["G1".into(), "G2".into(), "G3".into()],
        &[
            (0, 0, 1.),
            (1, 0, 2.),
            (2, 0, 1.),
            (3, 0, 4.),
            (0, 1, 3.),
            (1, 1, 1.),
            (2, 1, 1.),
            (3, 1, 2.),
            (2, 2, 5.),
        ],
    )
    .unwrap();
    let params = QcParams {
        min_genes_per_cell: 1,
        max_genes_per_cell: 10,
        min_cells_per_gene: 2,
    };
    let (data, _) = filter_cells_and_genes(data, &params).unwrap();
    assert_eq!((data.num_cells(), data.num_genes()), (4, 2));
    assert_eq!(data.genes(), &[Box::<str>::from("G1"), "G2".into()]);
    assert_eq!(data.cells().len(), 4);
}

#[test]
fn zero_count_cell_is_rejected_by_regression() {
    let data = ExpressionContainer::from_triplets(
        vec!["a".into(), "b".into(), "empty".into()],
        vec!["mt-Co1".into(), "Snap25".into()],
        &[(0, 0, 1.), (0, 1, 3.), (1, 1, 2.)],
    )
    .unwrap();
    let err = regress_and_scale(data, &ScaleParams::default()).unwrap_err();
    assert!(matches!(
        kind_of(&err),
        Some(LentilError::DataIntegrity {
            stage: Stage::Regression,
            ..
        })
    ));
}

#[test]
fn rescoring_the_snapshot_is_bit_identical() {
    let params = small_params();
    let tables = reference_tables();
    let out = run_pipeline(synthetic_container(2), &tables, &params).unwrap();

    let again =
        score_drug_responses(&out.snapshot, &tables, &params.pharmacology, &mut vec![]).unwrap();
    assert_eq!(again, out.scores);
    assert!(again
        .camp
        .iter()
        .zip(out.scores.camp.iter())
        .all(|(a, b)| a.to_bits() == b.to_bits()));
}

#[test]
fn drug_without_gq_affinity_has_no_gq_effect() {
    let params = small_params();
    let out = run_pipeline(synthetic_container(3), &reference_tables(), &params).unwrap();
    let ca = out.scores.ca_of("HALOPERIDOL").unwrap();
    assert!(ca.iter().all(|&x| x == params.pharmacology.ca_offset));

    let key = AnnotationKey::Response(ResponseKey {
        drug: "HALOPERIDOL".into(),
        quantity: ResponseQuantity::CaModulation,
    });
    assert_eq!(out.data.annotations.numeric(&key), Some(ca.as_slice()));

    // ADRB2 and OLIG2 are not measured
    assert!(out.diagnostics.iter().any(|d| d.subject.as_ref() == "ADRB2"));
    assert!(out.diagnostics.iter().any(|d| d.subject.as_ref() == "OLIG2"));
}

#[test]
fn fixed_seed_gives_identical_pca() {
    let params = small_params();
    let a = run_pipeline(synthetic_container(4), &reference_tables(), &params).unwrap();
    let b = run_pipeline(synthetic_container(4), &reference_tables(), &params).unwrap();
    assert_eq!(a.pca.basis.train_cells, b.pca.basis.train_cells);
    assert_eq!(a.pca.basis.components, b.pca.basis.components);
    assert_eq!(a.pca.embedding, b.pca.embedding);
    assert_eq!(a.embedding.kmeans.labels, b.embedding.kmeans.labels);
    assert_eq!(a.pca.basis.train_cells.len(), a.data.num_cells() / 2);
}

#[test]
fn too_few_training_cells_for_components() {
    let mut params = small_params();
    params.pca.n_components = 20;
    params.pca.train_ratio = 0.1;
    let err = run_pipeline(synthetic_container(5), &reference_tables(), &params).unwrap_err();
    assert!(matches!(
        kind_of(&err),
        Some(LentilError::InsufficientSamples {
            stage: Stage::Pca,
            requested: 20,
            ..
        })
    ));
}

#[test]
fn unknown_reference_compound_is_fatal() {
    let mut params = small_params();
    params.selectivity.reference_compound = "RISPERIDONE".into();
    let err = run_pipeline(synthetic_container(6), &reference_tables(), &params).unwrap_err();
    assert!(matches!(kind_of(&err), Some(LentilError::Configuration(_))));
}

fn two_drug_scores(reference_camp: &[f32], other_camp: &[f32]) -> DrugResponseScores {
    let n = reference_camp.len();
    let mut camp = Mat::zeros(n, 2);
    camp.column_mut(0).copy_from_slice(reference_camp);
    camp.column_mut(1).copy_from_slice(other_camp);
    DrugResponseScores {
        cells: (0..n).map(|i| format!("c{}", i).into_boxed_str()).collect(),
        drugs: vec!["CLOZAPINE".into(), "OTHER".into()],
        camp,
        ca: Mat::zeros(n, 2),
    }
}

#[test]
fn activation_needs_more_than_ten() {
    let scores = two_drug_scores(&[10., 10.01], &[1., 1.]);
    let flags = classify_selectivity(&scores, &SelectivityParams::default()).unwrap();
    assert_eq!(flags.activated, vec![false, true]);
}

#[test]
fn selectivity_ratio_of_exactly_one_and_a_half_is_not_selective() {
    // 0.45927933² / 0.375² is exactly 1.5 in single precision
    let scores = two_drug_scores(&[0.459_279_33, 0.5], &[0.375, 0.375]);
    let flags = classify_selectivity(&scores, &SelectivityParams::default()).unwrap();
    assert_eq!(flags.ratio[0], 1.5);
    assert_eq!(flags.selective, vec![false, true]);
}

#[test]
fn labels_follow_cells_through_filtering() {
    let mut data = synthetic_container(7);
    let labels: HashMap<Box<str>, Box<str>> = data
        .cells()
        .iter()
        .enumerate()
        .map(|(i, c)| (c.clone(), format!("group{}", i / N_PER_GROUP).into_boxed_str()))
        .collect();
    attach_labels(&mut data, &labels).unwrap();

    let out = run_pipeline(data, &reference_tables(), &small_params()).unwrap();
    let column = out.data.annotations.categorical(&AnnotationKey::Label).unwrap();
    for (cell, label) in out.data.cells().iter().zip(column.iter()) {
        assert_eq!(labels.get(cell), Some(label));
    }
}

#[test]
fn outputs_are_written_with_annotation_columns() {
    let dir = tempfile::tempdir().unwrap();
    let header = dir.path().join("sample_processed").to_string_lossy().to_string();
    let params = small_params();
    let out = run_pipeline(synthetic_container(8), &reference_tables(), &params).unwrap();
    let files = write_outputs(&header, &out, &params, true).unwrap();

    let obs = peek_parquet_field_names(&files.obs).unwrap();
    for name in [
        "row",
        "n_genes",
        "n_counts",
        "percent_mito",
        "SNAP25_raw",
        "HTR1A_raw",
        "kmeans",
        "louvain",
        "leiden",
        "cAMP_CLOZAPINE",
        "Ca_HALOPERIDOL",
        "CLOZAPINE_activated",
        "CLOZAPINE_inhibited",
        "cAMP_mean_other_than_CLOZAPINE",
        "cAMP_CLOZAPINE_selectivity",
        "CLOZAPINE_selective",
    ] {
        assert!(obs.iter().any(|x| x.as_ref() == name), "missing {}", name);
    }

    let pca = peek_parquet_field_names(&files.pca).unwrap();
    assert_eq!(pca.len(), 1 + 5);
    let umap = peek_parquet_field_names(&files.umap).unwrap();
    assert_eq!(umap, vec![Box::<str>::from("row"), "UMAP1".into(), "UMAP2".into()]);

    for file in [
        &files.tsne,
        &files.pca_loadings,
        &files.selective_markers,
        &files.diagnostics,
        &files.params,
        &files.scaled_mtx,
        &files.scaled_genes,
        &files.scaled_cells,
    ] {
        assert!(std::path::Path::new(&file[..]).exists(), "{}", file);
    }

    let reloaded = PipelineParams::from_json_file(&files.params).unwrap();
    assert_eq!(reloaded, params);
}
