use crate::ports::PortRange;
use crate::types::{WorkItem, WorkTarget};
use crate::wordlist::Wordlist;

/// Boxed lazy work sequence handed to the worker pool.
pub type WorkIter = Box<dyn Iterator<Item = WorkItem> + Send>;

/// The sized work sequence of one scan.
#[derive(Debug, Clone)]
pub enum Targets {
    Ports(PortRange),
    Paths(Wordlist),
}

impl Targets {
    pub fn len(&self) -> u64 {
        match self {
            Targets::Ports(range) => range.len(),
            Targets::Paths(words) => words.len() as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fresh iterator over the work items, ordinals `0..len()`.
    pub fn iter(&self) -> WorkIter {
        match self {
            Targets::Ports(range) => Box::new(range.iter().enumerate().map(|(i, port)| WorkItem {
                ordinal: i as u64,
                target: WorkTarget::Port(port),
            })),
            Targets::Paths(words) => {
                let paths = words.shared();
                let len = paths.len();
                Box::new((0..len).map(move |i| WorkItem {
                    ordinal: i as u64,
                    target: WorkTarget::Path(paths[i].clone()),
                }))
            }
        }
    }
}
