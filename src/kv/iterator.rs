use std::fmt;

use crate::Error;
use crate::KeyVal;
use crate::KvPair;
use crate::Result;

/// Iterator over keys and values
pub type KvIterator = ListIter<KvPair>;
/// Iterator over keys only
pub type KeyIterator = ListIter<KeyVal>;

type Mapper<T> = Box<dyn FnMut(T) -> Result<Option<T>> + Send>;

enum Source<T> {
    Snapshot(std::vec::IntoIter<T>),
    Lazy(Box<dyn Iterator<Item = Result<T>> + Send>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IterState {
    Open,
    Done,
    Closed,
}

/// Forward-only single-pass cursor over a list result.
///
/// Once `next` returned `Ok(None)` every later call returns `Ok(None)`.
/// After `close` calls fail with `Closed`. Concurrent writes made after
/// construction may or may not be observed.
pub struct ListIter<T> {
    source: Option<Source<T>>,
    mappers: Vec<Mapper<T>>,
    state: IterState,
}

impl<T: Send + 'static> ListIter<T> {
    /// Iterator over a result materialised up front
    pub fn from_vec(items: Vec<T>) -> Self {
        Self {
            source: Some(Source::Snapshot(items.into_iter())),
            mappers: Vec::new(),
            state: IterState::Open,
        }
    }

    /// Iterator pulling from a backend cursor on demand
    pub fn from_lazy(iter: impl Iterator<Item = Result<T>> + Send + 'static) -> Self {
        Self {
            source: Some(Source::Lazy(Box::new(iter))),
            mappers: Vec::new(),
            state: IterState::Open,
        }
    }

    pub fn empty() -> Self {
        Self::from_vec(Vec::new())
    }

    /// Adds a transformation applied to every item; `Ok(None)` skips it.
    pub fn filter_map(
        mut self,
        f: impl FnMut(T) -> Result<Option<T>> + Send + 'static,
    ) -> Self {
        self.mappers.push(Box::new(f));
        self
    }

    pub fn map(
        self,
        mut f: impl FnMut(T) -> Result<T> + Send + 'static,
    ) -> Self {
        self.filter_map(move |item| f(item).map(Some))
    }

    pub async fn next(&mut self) -> Result<Option<T>> {
        match self.state {
            IterState::Closed => return Err(Error::Closed("iterator")),
            IterState::Done => return Ok(None),
            IterState::Open => {}
        }

        loop {
            let item = match self.source.as_mut() {
                Some(Source::Snapshot(items)) => items.next().map(Ok),
                Some(Source::Lazy(cursor)) => cursor.next(),
                None => None,
            };
            let Some(item) = item else {
                self.state = IterState::Done;
                self.source = None;
                return Ok(None);
            };

            let mut current = Some(item?);
            for mapper in self.mappers.iter_mut() {
                current = match current {
                    Some(value) => mapper(value)?,
                    None => break,
                };
            }
            if current.is_some() {
                return Ok(current);
            }
        }
    }

    /// Releases the cursor; idempotent.
    pub fn close(&mut self) {
        self.source = None;
        self.mappers.clear();
        self.state = IterState::Closed;
    }

    pub fn is_closed(&self) -> bool {
        self.state == IterState::Closed
    }

    /// Drains the remaining items.
    pub async fn try_collect(mut self) -> Result<Vec<T>> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await? {
            items.push(item);
        }
        Ok(items)
    }
}

impl<T> fmt::Debug for ListIter<T> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let source = match self.source {
            Some(Source::Snapshot(_)) => "snapshot",
            Some(Source::Lazy(_)) => "lazy",
            None => "released",
        };
        f.debug_struct("ListIter")
            .field("source", &source)
            .field("mappers", &self.mappers.len())
            .field("state", &self.state)
            .finish()
    }
}
