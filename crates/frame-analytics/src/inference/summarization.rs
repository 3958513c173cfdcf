use serde::Serialize;
use serde_json::Value;

use super::encoding::Encoding;
use crate::error::Result;
use crate::io::{DEFAULT_CHUNK_SIZE, chunk_encoded, compress_to_base64};

/// Sample of training rows kept so a model can be updated later.
///
/// Cells are numbers, category names or null for missing values.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataSummarization {
    pub num_columns: usize,
    pub column_names: Vec<String>,
    pub categorical_column_names: Vec<String>,
    pub data: Vec<Vec<Value>>,
    pub encodings: Vec<Encoding>,
}

impl DataSummarization {
    pub fn number_rows(&self) -> usize {
        self.data.len()
    }

    pub fn json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn json_compressed_stream(&self) -> Result<String> {
        Ok(compress_to_base64(self.json_string()?.as_bytes())?)
    }

    pub fn compressed_chunks(&self) -> Result<Vec<String>> {
        Ok(chunk_encoded(&self.json_compressed_stream()?, DEFAULT_CHUNK_SIZE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::decompress_chunks;
    use serde_json::json;

    #[test]
    fn compressed_round_trip() {
        let summarization = DataSummarization {
            num_columns: 2,
            column_names: vec!["x".into(), "c".into()],
            categorical_column_names: vec!["c".into()],
            data: vec![vec![json!(1.5), json!("a")], vec![Value::Null, json!("b")]],
            encodings: Vec::new(),
        };
        assert_eq!(summarization.number_rows(), 2);
        let chunks = summarization.compressed_chunks().unwrap();
        let text = decompress_chunks(&chunks).unwrap();
        assert_eq!(text, summarization.json_string().unwrap());
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["data"][1], json!([null, "b"]));
    }
}
