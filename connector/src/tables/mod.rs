pub mod session;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use connector_core::{Error, Result};

use crate::model::Row;

pub use session::{FetchContext, TableSession};

/// A settled table result, shared between dependents and consumers.
pub type TableRows = Arc<Vec<Row>>;

/// One extractable table. Dependencies are other table ids; they are fully
/// resolved before `fetch` runs and handed over in `depends_on` order.
#[async_trait]
pub trait Table: Send + Sync {
    fn id(&self) -> &str;

    fn depends_on(&self) -> &[String] {
        &[]
    }

    /// Produce the table's rows. `increment` is the incremental-refresh
    /// token when the consumer supplied one.
    async fn fetch(
        &self,
        ctx: &FetchContext,
        increment: Option<&str>,
        deps: &[TableRows],
    ) -> Result<Vec<Row>>;

    /// Reshape fetched rows before they are cached. Identity by default.
    fn post_process(&self, rows: Vec<Row>) -> Result<Vec<Row>> {
        Ok(rows)
    }
}

/// All tables known to this deployment, validated as a whole before any
/// fetch: every dependency must be registered and the graph must be acyclic.
#[derive(Default)]
pub struct TableRegistry {
    tables: HashMap<String, Arc<dyn Table>>,
}

impl TableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, table: Arc<dyn Table>) -> Result<()> {
        let id = table.id().to_string();
        if self.tables.contains_key(&id) {
            return Err(Error::Config(format!("table '{id}' registered twice")));
        }
        self.tables.insert(id, table);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Arc<dyn Table>> {
        self.tables.get(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        self.topo_order().map(|_| ())
    }

    /// Registered ids with every dependency ahead of its dependents.
    /// Rejects unknown dependencies and cycles, naming the offender.
    pub fn topo_order(&self) -> Result<Vec<String>> {
        let mut marks: HashMap<&str, Mark> = HashMap::new();
        let mut stack: Vec<&str> = Vec::new();
        let mut order: Vec<String> = Vec::with_capacity(self.tables.len());

        let mut roots: Vec<&str> = self.tables.keys().map(String::as_str).collect();
        roots.sort_unstable();

        for id in roots {
            self.visit(id, &mut marks, &mut stack, &mut order)?;
        }
        Ok(order)
    }

    fn visit<'a>(
        &'a self,
        id: &'a str,
        marks: &mut HashMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
        order: &mut Vec<String>,
    ) -> Result<()> {
        match marks.get(id) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::InProgress) => {
                let from = stack.iter().position(|s| *s == id).unwrap_or(0);
                let mut path = stack[from..].to_vec();
                path.push(id);
                return Err(Error::Config(format!(
                    "dependency cycle: {}",
                    path.join(" -> ")
                )));
            }
            None => {}
        }

        let table = match self.tables.get(id) {
            Some(table) => table,
            None => {
                let dependent = stack.last().copied().unwrap_or("?");
                return Err(Error::Config(format!(
                    "table '{dependent}' depends on unknown table '{id}'"
                )));
            }
        };

        marks.insert(id, Mark::InProgress);
        stack.push(id);
        for dep in table.depends_on() {
            self.visit(dep, marks, stack, order)?;
        }
        stack.pop();
        marks.insert(id, Mark::Done);
        order.push(id.to_string());
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum Mark {
    InProgress,
    Done,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    struct Plain {
        id: String,
        deps: Vec<String>,
    }

    impl Plain {
        fn new(id: &str, deps: &[&str]) -> Arc<dyn Table> {
            Arc::new(Self {
                id: id.to_string(),
                deps: deps.iter().map(|d| d.to_string()).collect(),
            })
        }
    }

    #[async_trait]
    impl Table for Plain {
        fn id(&self) -> &str {
            &self.id
        }

        fn depends_on(&self) -> &[String] {
            &self.deps
        }

        async fn fetch(
            &self,
            _ctx: &FetchContext,
            _increment: Option<&str>,
            _deps: &[TableRows],
        ) -> Result<Vec<Row>> {
            Ok(Vec::new())
        }
    }

    fn registry(tables: &[Arc<dyn Table>]) -> TableRegistry {
        let mut registry = TableRegistry::new();
        for table in tables {
            registry.register(table.clone()).unwrap();
        }
        registry
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = TableRegistry::new();
        registry.register(Plain::new("keyword", &[])).unwrap();
        let err = registry.register(Plain::new("keyword", &[])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn topo_order_puts_dependencies_first() {
        let registry = registry(&[
            Plain::new("a", &["b", "c"]),
            Plain::new("b", &["d"]),
            Plain::new("c", &["d"]),
            Plain::new("d", &[]),
        ]);
        let order = registry.topo_order().unwrap();

        let pos = |id: &str| order.iter().position(|o| o == id).unwrap();
        assert!(pos("d") < pos("b"));
        assert!(pos("d") < pos("c"));
        assert!(pos("b") < pos("a"));
        assert!(pos("c") < pos("a"));
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn unknown_dependency_names_the_dependent() {
        let registry = registry(&[Plain::new("a", &["ghost"])]);
        let err = registry.validate().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("'a'"), "{message}");
        assert!(message.contains("'ghost'"), "{message}");
    }

    #[test]
    fn cycle_is_reported_with_its_path() {
        let registry = registry(&[
            Plain::new("a", &["b"]),
            Plain::new("b", &["c"]),
            Plain::new("c", &["a"]),
        ]);
        let err = registry.validate().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("cycle"), "{message}");
        assert!(message.contains("a -> b -> c -> a"), "{message}");
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let registry = registry(&[Plain::new("a", &["a"])]);
        assert!(registry.validate().is_err());
    }

    #[test]
    fn empty_registry_is_valid() {
        assert!(TableRegistry::new().validate().is_ok());
    }
}
