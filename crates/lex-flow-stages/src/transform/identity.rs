use crate::utils::keys;
use lex_flow::{Inputs, Outputs, Result, RunContext, Stage};
use std::collections::BTreeSet;

/// Forwards each input `k` unchanged to output `k_out`.
///
/// Values are passed on in whatever storage they arrived in, so a relational
/// reference stays a reference.
#[derive(Debug, Clone)]
pub struct Identity {
    keys: Vec<String>,
}

impl Identity {
    pub fn new<I, S>(ports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { keys: keys(ports) }
    }

    pub fn output_key(key: &str) -> String {
        format!("{key}_out")
    }
}

impl Stage for Identity {
    fn input_keys(&self) -> Vec<String> {
        self.keys.clone()
    }

    fn output_keys(&self) -> Vec<String> {
        self.keys.iter().map(|k| Self::output_key(k)).collect()
    }

    fn run(
        &self,
        _ctx: &RunContext,
        outputs_requested: &BTreeSet<String>,
        mut inputs: Inputs,
    ) -> Result<Outputs> {
        let mut outputs = Outputs::new();
        for key in &self.keys {
            let out_key = Self::output_key(key);
            if outputs_requested.contains(&out_key) {
                outputs.insert(out_key, inputs.take(key)?.into_output()?);
            }
        }
        Ok(outputs)
    }
}
