//! End to end runs through the analyzer: rows in, result documents out.

use frame_analytics::io::{ConcurrentLineWriter, SharedBuffer, decompress_chunks};
use frame_analytics::persist::MemoryStateStore;
use frame_analytics::testing::{SpecificationFactory, classification_rows, outlier_rows, regression_rows};
use frame_analytics::DataFrameAnalyzer;
use serde_json::Value;

fn run(factory: SpecificationFactory, rows: &frame_analytics::testing::SyntheticRows) -> Vec<Value> {
    let buffer = SharedBuffer::new();
    let mut analyzer = DataFrameAnalyzer::new(factory.specification(), ConcurrentLineWriter::new(buffer.clone()));
    assert!(analyzer.specification().is_valid());
    assert!(rows.feed_and_run(&mut analyzer));
    buffer.documents()
}

fn documents<'a>(documents: &'a [Value], key: &str) -> Vec<&'a Value> {
    documents.iter().filter_map(|document| document.get(key)).collect()
}

/// Concatenate and decompress chunked documents.
fn inflate(documents: &[Value], key: &str, field: &str) -> Value {
    let chunks = self::documents(documents, key);
    assert!(chunks.last().unwrap()["eos"].as_bool().unwrap());
    let chunks: Vec<&str> = chunks.iter().map(|chunk| chunk[field].as_str().unwrap()).collect();
    serde_json::from_str(&decompress_chunks(&chunks).unwrap()).unwrap()
}

#[test]
fn regression_produces_encodings_and_an_ensemble() {
    let rows = regression_rows(1000, 17);
    let factory = SpecificationFactory::new()
        .rows(1000)
        .cols(3)
        .memory_limit(30_000_000)
        .categorical_fields(vec!["categorical_col".to_string()])
        .regression("target_col")
        .parameter("max_trees", 10);
    let output = run(factory, &rows);

    let results = documents(&output, "row_results");
    assert_eq!(results.len(), 1000);
    assert!(results[0]["results"]["ml"]["target_col_prediction"].is_number());

    let definition = inflate(&output, "compressed_inference_model", "definition");
    let preprocessors = definition["preprocessors"].as_array().unwrap();
    assert_eq!(preprocessors.len(), 3);
    let mut kinds: Vec<&str> = preprocessors
        .iter()
        .flat_map(|preprocessor| preprocessor.as_object().unwrap().keys())
        .map(String::as_str)
        .collect();
    kinds.sort_unstable();
    assert_eq!(kinds, ["frequency_encoding", "one_hot_encoding", "target_mean_encoding"]);
    let ensemble = &definition["trained_model"]["ensemble"];
    assert_eq!(ensemble["target_type"], "regression");

    let size_info = documents(&output, "model_size_info");
    let tree_sizes = size_info[0]["trained_model_size"]["ensemble_model_size"]["tree_sizes"]
        .as_array()
        .unwrap();
    let trees = ensemble["trained_models"].as_array().unwrap();
    assert_eq!(tree_sizes.len(), trees.len());
    for (size, tree) in tree_sizes.iter().zip(trees) {
        assert_eq!(
            size["num_nodes"].as_u64().unwrap() as usize,
            tree["tree"]["tree_structure"].as_array().unwrap().len()
        );
    }

    let metadata = documents(&output, "model_metadata");
    assert_eq!(metadata[0]["train_properties"]["num_train_rows"], 1000);
}

#[test]
fn classification_scores_are_weighted_probabilities() {
    let rows = classification_rows(300, 3);
    let factory = SpecificationFactory::new()
        .rows(300)
        .cols(3)
        .categorical_fields(vec!["label".to_string()])
        .classification("label")
        .parameter("num_classes", 3)
        .parameter("max_trees", 8)
        .parameter("num_top_classes", -1);
    let output = run(factory, &rows);

    let definition = inflate(&output, "compressed_inference_model", "definition");
    let ensemble = &definition["trained_model"]["ensemble"];
    assert_eq!(ensemble["target_type"], "classification");
    let labels: Vec<&str> = ensemble["classification_labels"]
        .as_array()
        .unwrap()
        .iter()
        .map(|label| label.as_str().unwrap())
        .collect();
    let weights: Vec<f64> = ensemble["classification_weights"]
        .as_array()
        .unwrap()
        .iter()
        .map(|weight| weight.as_f64().unwrap())
        .collect();
    assert_eq!(labels.len(), 3);
    assert_eq!(weights.len(), 3);

    for result in documents(&output, "row_results") {
        let result = &result["results"]["ml"];
        let label = result["label_prediction"].as_str().unwrap();
        let class = labels.iter().position(|l| *l == label).unwrap();
        let probability = result["prediction_probability"].as_f64().unwrap();
        let score = result["prediction_score"].as_f64().unwrap();
        let expected = weights[class] * probability;
        assert!((score - expected).abs() <= 1e-3 * expected.abs().max(1e-12));
        assert_eq!(result["top_classes"].as_array().unwrap().len(), 3);
    }
}

#[test]
fn data_summarization_is_written_when_requested() {
    let rows = regression_rows(200, 5);
    let factory = SpecificationFactory::new()
        .rows(200)
        .cols(3)
        .categorical_fields(vec!["categorical_col".to_string()])
        .regression("target_col")
        .parameter("max_trees", 2)
        .parameter("data_summarization_fraction", 0.25);
    let output = run(factory, &rows);

    let summarization = inflate(&output, "compressed_data_summarization", "data_summarization");
    assert_eq!(summarization["num_columns"], 3);
    let sampled = summarization["data"].as_array().unwrap().len();
    assert!(sampled > 0 && sampled < 200);
    let metadata = documents(&output, "model_metadata");
    assert_eq!(
        metadata[0]["data_summarization"]["num_data_summarization_rows"],
        sampled
    );
}

#[test]
fn outlier_detection_flags_the_far_points() {
    let rows = outlier_rows(200, 3, 2, 11);
    let factory = SpecificationFactory::new().rows(203).cols(2);
    let output = run(factory, &rows);

    let scores: Vec<f64> = documents(&output, "row_results")
        .iter()
        .map(|result| result["results"]["ml"]["outlier_score"].as_f64().unwrap())
        .collect();
    assert_eq!(scores.len(), 203);
    let cluster_max = scores[..200].iter().copied().fold(f64::MIN, f64::max);
    assert!(scores[200..].iter().all(|&score| score > cluster_max));
    assert!(documents(&output, "compressed_inference_model").is_empty());
    assert!(!documents(&output, "analysis_stats").is_empty());
}

#[test]
fn training_state_is_checkpointed() {
    let store = MemoryStateStore::new();
    let rows = regression_rows(100, 1);
    let factory = SpecificationFactory::new()
        .rows(100)
        .cols(3)
        .categorical_fields(vec!["categorical_col".to_string()])
        .regression("target_col")
        .parameter("max_trees", 3)
        .persistence(store.persister_supplier(), store.restore_searcher_supplier());
    run(factory, &rows);

    let documents = store.documents();
    assert_eq!(documents.len(), 1);
    let state: Value = serde_json::from_str(&documents[0]).unwrap();
    assert!(state.get("forest").is_some());
}

#[test]
fn threads_do_not_change_the_model() {
    let rows = regression_rows(300, 9);
    let definition = |threads: usize| {
        let factory = SpecificationFactory::new()
            .rows(300)
            .cols(3)
            .threads(threads)
            .categorical_fields(vec!["categorical_col".to_string()])
            .regression("target_col")
            .parameter("max_trees", 4);
        inflate(&run(factory, &rows), "compressed_inference_model", "definition")
    };
    assert_eq!(definition(1), definition(3));
}
