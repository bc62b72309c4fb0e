use std::fmt::Display;
use std::fmt::Formatter;

use serde::Deserialize;
use serde::Serialize;

/// The identity of a log entry: the term in which it was created and its position in the log.
///
/// The comparison of two `LogId`s is the "up-to-date" ordering of §5.4.1: a higher term wins, and
/// within a term a higher index wins. The derived lexicographic ordering implements exactly that.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogId {
    pub term: u64,
    pub index: u64,
}

impl Display for LogId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.term, self.index)
    }
}

impl LogId {
    pub fn new(term: u64, index: u64) -> Self {
        LogId { term, index }
    }
}

#[cfg(test)]
mod tests {
    use super::LogId;

    #[test]
    fn test_log_id_ordering_is_up_to_date_ordering() {
        // Higher term wins regardless of index.
        assert!(LogId::new(2, 1) > LogId::new(1, 9));
        // Equal terms: higher index wins.
        assert!(LogId::new(2, 5) > LogId::new(2, 4));
        assert_eq!(LogId::new(3, 3), LogId::new(3, 3));
    }
}
