use std::collections::HashMap;

/// Dense ids for the distinct strings of one categorical column.
///
/// Ids are assigned in first-seen order unless the dictionary is rebuilt
/// with [`CategoryDictionary::aligned_to`].
#[derive(Debug, Clone, Default)]
pub struct CategoryDictionary {
    names: Vec<String>,
    ids: HashMap<String, usize>,
}

impl CategoryDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id for `name`, inserting it if it has not been seen.
    pub fn id_or_insert(&mut self, name: &str) -> usize {
        if let Some(&id) = self.ids.get(name) {
            return id;
        }
        let id = self.names.len();
        self.names.push(name.to_string());
        self.ids.insert(name.to_string(), id);
        id
    }

    /// A dictionary whose first ids are `names` in order, followed by this
    /// dictionary's remaining names in their current order.
    pub fn aligned_to(&self, names: &[String]) -> Self {
        let mut aligned = Self::new();
        for name in names.iter().chain(&self.names) {
            aligned.id_or_insert(name);
        }
        aligned
    }

    pub fn id(&self, name: &str) -> Option<usize> {
        self.ids.get(name).copied()
    }

    pub fn name(&self, id: usize) -> Option<&str> {
        self.names.get(id).map(String::as_str)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_follow_first_seen_order() {
        let mut dict = CategoryDictionary::new();
        assert_eq!(dict.id_or_insert("b"), 0);
        assert_eq!(dict.id_or_insert("a"), 1);
        assert_eq!(dict.id_or_insert("b"), 0);
        assert_eq!(dict.names(), ["b", "a"]);
        assert_eq!(dict.id("a"), Some(1));
    }

    #[test]
    fn aligning_puts_known_names_first() {
        let mut dict = CategoryDictionary::new();
        for name in ["c", "a", "b"] {
            dict.id_or_insert(name);
        }
        let aligned = dict.aligned_to(&["b".to_string(), "z".to_string(), "a".to_string()]);
        assert_eq!(aligned.names(), ["b", "z", "a", "c"]);
        assert_eq!(aligned.id("c"), Some(3));
        assert_eq!(dict.name(2), None);
    }
}
