//! Registry of stored transaction functions: attributes whose `:db/fn`
//! value names a function registered here can be invoked from a
//! transaction as `(:call entity fn-ident args...)`, expanding into the
//! primitive `:db/add`/`:db/retract` operations the function computes.
//!
//! Kept deliberately small — a couple of named implementations, not a
//! scripting host.

use std::collections::HashMap;
use std::rc::Rc;

use crate::datom::Value;
use crate::db::Db;
use crate::tx::{Statement, TransactError};

pub type TxFn = fn(&Db, u64, &[Value]) -> Result<Vec<Statement>, TransactError>;

pub struct TxFunctions {
    functions: HashMap<Rc<str>, TxFn>,
}

impl Default for TxFunctions {
    fn default() -> Self {
        let mut registry = TxFunctions {
            functions: HashMap::new(),
        };
        registry.register("db.fn/retractIfEmpty", retract_if_empty);
        registry
    }
}

impl TxFunctions {
    pub fn register(&mut self, ident: impl Into<Rc<str>>, f: TxFn) {
        self.functions.insert(ident.into(), f);
    }

    pub fn resolve(&self, ident: &str) -> Option<TxFn> {
        self.functions.get(ident).copied()
    }
}

/// Built-in: retracts `entity` entirely, but only if it currently has no
/// asserted attributes of its own. A no-op otherwise.
fn retract_if_empty(db: &Db, entity: u64, _args: &[Value]) -> Result<Vec<Statement>, TransactError> {
    let has_any = !db
        .storage
        .slice(crate::datom::Index::Eavt, Some(entity), None, None)
        .map_err(TransactError::Storage)?
        .is_empty();
    if has_any {
        Ok(Vec::new())
    } else {
        Ok(vec![Statement::RetractEntity {
            entity: crate::tx::Entity::Id(entity),
        }])
    }
}
