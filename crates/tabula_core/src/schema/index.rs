/// Name of the clustered index.
pub const PRIMARY_INDEX: &str = "PRIMARY";

/// An index over column positions of its schema.
///
/// `columns` are the columns the index was declared on. `key_columns` form the
/// stored key tuple: for the clustered index the primary key, for a secondary
/// index the declared columns followed by any primary-key columns not already
/// present. `value_columns` are stored next to the key and are only used by
/// the clustered index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Index {
    pub name: String,
    pub columns: Vec<u16>,
    pub key_columns: Vec<u16>,
    pub value_columns: Vec<u16>,
    pub unique: bool,
    pub system_defined: bool,
    pub comment: Option<String>,
}

impl Index {
    pub fn clustered(pk: Vec<u16>, values: Vec<u16>) -> Self {
        Index {
            name: PRIMARY_INDEX.to_string(),
            columns: pk.clone(),
            key_columns: pk,
            value_columns: values,
            unique: true,
            system_defined: false,
            comment: None,
        }
    }

    pub fn secondary(name: impl Into<String>, columns: Vec<u16>, pk: &[u16], unique: bool) -> Self {
        let mut key_columns = columns.clone();
        key_columns.extend(pk.iter().filter(|p| !columns.contains(p)));
        Index {
            name: name.into(),
            columns,
            key_columns,
            value_columns: Vec::new(),
            unique,
            system_defined: false,
            comment: None,
        }
    }

    pub fn with_comment(mut self, c: impl Into<String>) -> Self {
        self.comment = Some(c.into());
        self
    }

    pub fn references(&self, pos: u16) -> bool {
        self.columns.contains(&pos) || self.key_columns.contains(&pos) || self.value_columns.contains(&pos)
    }

    /// Rewrite every position through `map`; `None` drops the position.
    pub(crate) fn remap(&mut self, map: impl Fn(u16) -> Option<u16>) {
        for list in [&mut self.columns, &mut self.key_columns, &mut self.value_columns] {
            *list = list.iter().filter_map(|&p| map(p)).collect();
        }
    }
}
