//! Shared test fixtures: a minimal on-disk model artifact.

use std::io::Write;
use std::path::Path;

use tempfile::TempDir;

/// Install a test-writer subscriber once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Write a loadable model directory: `config.json` plus a weight file
/// holding the embedding table and ranking head.
pub fn model_dir(model_id: &str, num_items: usize, hidden_dim: usize) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    write_model_fixture(dir.path(), model_id, num_items, hidden_dim);
    dir
}

pub fn write_model_fixture(dir: &Path, model_id: &str, num_items: usize, hidden_dim: usize) {
    std::fs::write(
        dir.join("config.json"),
        format!(
            r#"{{"model_id":"{model_id}","num_items":{num_items},"hidden_dim":{hidden_dim}}}"#
        ),
    )
    .unwrap();

    let mut data = Vec::new();
    for i in 0..num_items {
        for d in 0..hidden_dim {
            data.extend_from_slice(&(((i + d) % 9) as f32).to_le_bytes());
        }
    }
    let emb_end = data.len();
    for _ in 0..hidden_dim {
        data.extend_from_slice(&1.0f32.to_le_bytes());
    }
    let head_end = data.len();

    let header = format!(
        concat!(
            r#"{{"item_embedding.weight":{{"dtype":"F32","shape":[{},{}],"data_offsets":[0,{}]}},"#,
            r#""ranking_head.weight":{{"dtype":"F32","shape":[{}],"data_offsets":[{},{}]}}}}"#
        ),
        num_items, hidden_dim, emb_end, hidden_dim, emb_end, head_end
    );

    let mut file = std::fs::File::create(dir.join("model.safetensors")).unwrap();
    file.write_all(&(header.len() as u64).to_le_bytes()).unwrap();
    file.write_all(header.as_bytes()).unwrap();
    file.write_all(&data).unwrap();
}
