use crate::utils::keys;
use lex_flow::{Inputs, Outputs, Result, RunContext, Stage, UObject};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Renames columns of `in` according to an `old -> new` map.
///
/// Names missing from the input are ignored.
#[derive(Debug, Clone)]
pub struct RenameCols {
    renames: BTreeMap<String, String>,
}

impl RenameCols {
    pub fn new<I, K, V>(renames: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            renames: renames
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl Stage for RenameCols {
    fn input_keys(&self) -> Vec<String> {
        keys(["in"])
    }

    fn output_keys(&self) -> Vec<String> {
        keys(["out"])
    }

    fn run(&self, ctx: &RunContext, _: &BTreeSet<String>, mut inputs: Inputs) -> Result<Outputs> {
        let mut df = inputs.take("in")?.to_table(ctx.storage())?;
        for (old, new) in &self.renames {
            if df.get_column_index(old).is_none() {
                debug!("Column '{}' not present; nothing to rename", old);
                continue;
            }
            df.rename(old, new.as_str().into())?;
        }
        Ok(Outputs::from([("out".to_string(), UObject::table(df))]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polars::prelude::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_rename_cols() {
        let df = df!(
            "id" => &[1i64],
            "name" => &["ada"],
            "height" => &[1.7f64],
        )
        .unwrap();
        let inputs = Inputs::new(
            "RenameCols",
            BTreeMap::from([(
                "in".to_string(),
                UObject::table(df).promote_to_read().unwrap(),
            )]),
        );
        let stage = RenameCols::new([
            ("name", "designation"),
            ("height", "tallness"),
            ("missing", "ignored"),
        ]);

        let ctx = RunContext::default();
        let mut outputs = stage.run(&ctx, &BTreeSet::new(), inputs).unwrap();
        let out = outputs
            .remove("out")
            .unwrap()
            .promote_to_read()
            .unwrap()
            .to_table(ctx.storage())
            .unwrap();
        let names: Vec<String> = out
            .get_column_names()
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(names, vec!["id", "designation", "tallness"]);
    }
}
