use lex_flow::{
    ConnParams, FlowError, Inputs, Outputs, RelationalRequest, Result, RunContext, Stage, UObject,
};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("Invalid regex: sql placeholder")
});

/// Runs SQL against a database, reading and writing tables by reference.
///
/// `{key}` placeholders in the template are replaced by table names: for an
/// input key, the table holding that input (copied into `db_url` first when
/// it lives elsewhere); for an output key, a freshly generated table name the
/// SQL is expected to create. Statements are separated by `;` and run in
/// order.
#[derive(Debug, Clone)]
pub struct RunSql {
    db_url: String,
    sql: String,
    in_keys: Vec<String>,
    out_keys: Vec<String>,
    conn_params: ConnParams,
}

impl RunSql {
    pub fn new<I, O, S, T>(
        db_url: impl Into<String>,
        sql: impl Into<String>,
        in_keys: I,
        out_keys: O,
        conn_params: ConnParams,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        O: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
    {
        Self {
            db_url: db_url.into(),
            sql: sql.into(),
            in_keys: in_keys.into_iter().map(Into::into).collect(),
            out_keys: out_keys.into_iter().map(Into::into).collect(),
            conn_params,
        }
    }

    fn render(&self, tables: &BTreeMap<String, String>) -> Result<String> {
        let mut unknown = None;
        let sql = PLACEHOLDER.replace_all(&self.sql, |caps: &Captures| {
            let key = &caps[1];
            match tables.get(key) {
                Some(table) => table.clone(),
                None => {
                    unknown.get_or_insert_with(|| key.to_string());
                    caps[0].to_string()
                }
            }
        });
        if let Some(key) = unknown {
            return Err(FlowError::stage_failed(
                self.name(),
                format!("placeholder '{{{key}}}' is neither an input nor an output"),
            ));
        }
        Ok(sql.into_owned())
    }
}

impl Stage for RunSql {
    fn input_keys(&self) -> Vec<String> {
        self.in_keys.clone()
    }

    fn output_keys(&self) -> Vec<String> {
        self.out_keys.clone()
    }

    fn has_side_effects(&self) -> bool {
        true
    }

    fn run(&self, ctx: &RunContext, _: &BTreeSet<String>, mut inputs: Inputs) -> Result<Outputs> {
        let storage = ctx.storage();
        let request = RelationalRequest::new(&self.db_url).with_params(self.conn_params.clone());

        let mut tables = BTreeMap::new();
        for key in &self.in_keys {
            let info = inputs.take(key)?.to_relational(storage, &request)?;
            tables.insert(key.clone(), info.table);
        }
        for key in &self.out_keys {
            tables.insert(key.clone(), storage.generated_table_name());
        }

        let sql = self.render(&tables)?;
        let conn = storage.pool().acquire(&self.db_url, &self.conn_params)?;
        for statement in sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            debug!("Executing: {}", statement);
            conn.execute(statement)?;
        }

        let mut outputs = Outputs::new();
        for key in &self.out_keys {
            let table = &tables[key];
            if !conn.has_table(table) {
                return Err(FlowError::stage_failed(
                    self.name(),
                    format!("SQL did not create the table for output '{key}'"),
                ));
            }
            storage
                .pool()
                .record_generated(&self.db_url, &self.conn_params, table);
            let mut out = UObject::writer();
            out.from_relational(&self.db_url, self.conn_params.clone(), table, true)?;
            outputs.insert(key.clone(), out);
        }
        info!("Ran SQL on {} producing {} tables", self.db_url, outputs.len());
        Ok(outputs)
    }
}
