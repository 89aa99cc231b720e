use std::collections::HashSet;

/// A name handed out by a [`NameAllocator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatedName {
    pub name: String,
    /// Whether an instance with this name was already present on the server when the
    /// allocator last reconciled. The owner must drop it before reusing the name.
    pub stale: bool,
}

/// Generates unique instance names of the form `<prefix><n>`.
///
/// The counter starts at zero and only ever increases, so the first name is `<prefix>1`
/// and no name is handed out twice within the lifetime of an allocator.
#[derive(Debug, Clone)]
pub struct NameAllocator {
    prefix: String,
    counter: u64,
    existing: HashSet<String>,
}

impl NameAllocator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: 0,
            existing: HashSet::new(),
        }
    }

    /// Returns the number of names handed out so far.
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Returns the next name, flagged as stale if it collides with a reconciled name.
    pub fn next(&mut self) -> AllocatedName {
        self.counter += 1;
        let name = format!("{}{}", self.prefix, self.counter);
        let stale = self.existing.contains(&name);

        AllocatedName { name, stale }
    }

    /// Replaces the snapshot of names known to exist on the server.
    pub fn reconcile_existing<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.existing = names.into_iter().map(Into::into).collect();
    }

    /// Forgets a name from the snapshot once its stale instance has been dropped.
    pub fn forget(&mut self, name: &str) {
        self.existing.remove(name);
    }

    /// Returns `true` if `name` has been issued by this allocator.
    pub fn owns(&self, name: &str) -> bool {
        let Some(suffix) = name.strip_prefix(self.prefix.as_str()) else {
            return false;
        };

        // `u64::from_str` accepts a leading `+` and zero padding.
        let canonical = !suffix.is_empty()
            && !suffix.starts_with('0')
            && suffix.bytes().all(|b| b.is_ascii_digit());
        if !canonical {
            return false;
        }

        suffix
            .parse::<u64>()
            .is_ok_and(|index| index >= 1 && index <= self.counter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_sequential_and_start_at_one() {
        let mut names = NameAllocator::new("test_db");

        assert_eq!(names.next().name, "test_db1");
        assert_eq!(names.next().name, "test_db2");
        assert_eq!(names.next().name, "test_db3");
        assert_eq!(names.counter(), 3);
    }

    #[test]
    fn reconciled_names_are_flagged_stale_until_forgotten() {
        let mut names = NameAllocator::new("test_db");
        names.reconcile_existing(["postgres", "template1", "test_db2"]);

        assert!(!names.next().stale);

        let second = names.next();
        assert_eq!(second.name, "test_db2");
        assert!(second.stale);

        names.forget("test_db2");
        names.reconcile_existing(Vec::<String>::new());
        assert!(!names.next().stale);
    }

    #[test]
    fn owns_only_issued_names() {
        let mut names = NameAllocator::new("test_db");
        names.next();
        names.next();

        assert!(names.owns("test_db1"));
        assert!(names.owns("test_db2"));
        assert!(!names.owns("test_db3"));
        assert!(!names.owns("test_db0"));
        assert!(!names.owns("test_db01"));
        assert!(!names.owns("test_db+1"));
        assert!(!names.owns("test_db"));
        assert!(!names.owns("other_db1"));
        assert!(!names.owns("postgres"));
    }
}
