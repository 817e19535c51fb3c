//! SSM Parameter Store backend

use std::collections::HashMap;

use async_trait::async_trait;

use crate::cloud::aws::{str_field, AwsCli};
use crate::cloud::ParameterStore;
use crate::errors::CloudError;

/// `get-parameters` accepts at most ten names per call
const MAX_NAMES_PER_CALL: usize = 10;

/// Parameter store backed by SSM Parameter Store.
///
/// Parameters are read without decryption: secret references stay references.
pub struct SsmParameterStore {
    cli: AwsCli,
}

impl SsmParameterStore {
    pub fn new(cli: AwsCli) -> Self {
        Self { cli }
    }
}

#[async_trait]
impl ParameterStore for SsmParameterStore {
    async fn get_parameters(&self, names: &[String]) -> Result<HashMap<String, String>, CloudError> {
        let mut values = HashMap::new();
        for chunk in names.chunks(MAX_NAMES_PER_CALL) {
            let mut args = vec!["--names".to_string()];
            args.extend(chunk.iter().cloned());
            let output = self.cli.call("ssm", "get-parameters", &args).await?;
            values.extend(parse_parameters(&output));
        }
        Ok(values)
    }
}

/// Extract name -> value pairs from `get-parameters` output
pub fn parse_parameters(output: &serde_json::Value) -> HashMap<String, String> {
    output
        .get("Parameters")
        .and_then(|p| p.as_array())
        .into_iter()
        .flatten()
        .filter_map(|p| Some((str_field(p, "Name")?.to_string(), str_field(p, "Value")?.to_string())))
        .collect()
}
