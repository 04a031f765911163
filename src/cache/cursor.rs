//! Paged, restartable iteration over store collections.

use std::collections::VecDeque;

use crate::error::Result;

use super::storage::LocalStore;
use super::types::{CachedDocument, PendingMutation};

const DEFAULT_PAGE_SIZE: usize = 64;

/// Position of a document in `cached_at` descending order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentKey {
  pub cached_at_ms: i64,
  pub id: String,
}

/// Position of a mutation in `updated_at` ascending order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationKey {
  pub updated_at_ms: i64,
  pub seq: i64,
}

/// Records that can be listed page by page using keyset pagination.
pub trait Paged: Sized {
  type Key: Clone;

  fn page_key(&self) -> Self::Key;

  fn fetch_page<S: LocalStore + ?Sized>(
    store: &S,
    after: Option<&Self::Key>,
    limit: usize,
  ) -> Result<Vec<Self>>;
}

impl Paged for CachedDocument {
  type Key = DocumentKey;

  fn page_key(&self) -> DocumentKey {
    DocumentKey {
      cached_at_ms: self.cached_at.timestamp_millis(),
      id: self.meta.id.clone(),
    }
  }

  fn fetch_page<S: LocalStore + ?Sized>(
    store: &S,
    after: Option<&DocumentKey>,
    limit: usize,
  ) -> Result<Vec<Self>> {
    store.documents_page(after, limit)
  }
}

impl Paged for PendingMutation {
  type Key = MutationKey;

  fn page_key(&self) -> MutationKey {
    MutationKey {
      updated_at_ms: self.updated_at.timestamp_millis(),
      seq: self.seq,
    }
  }

  fn fetch_page<S: LocalStore + ?Sized>(
    store: &S,
    after: Option<&MutationKey>,
    limit: usize,
  ) -> Result<Vec<Self>> {
    store.mutations_page(after, limit)
  }
}

/// Lazy iterator over a collection. Pages are read on demand; nothing is
/// loaded until the first call to `next`. A storage error is yielded once and
/// ends the iteration.
pub struct Cursor<'a, S: ?Sized, T: Paged> {
  store: &'a S,
  page_size: usize,
  buffer: VecDeque<T>,
  after: Option<T::Key>,
  exhausted: bool,
}

impl<'a, S: LocalStore + ?Sized, T: Paged> Cursor<'a, S, T> {
  pub fn new(store: &'a S) -> Self {
    Self {
      store,
      page_size: DEFAULT_PAGE_SIZE,
      buffer: VecDeque::new(),
      after: None,
      exhausted: false,
    }
  }

  pub fn with_page_size(mut self, page_size: usize) -> Self {
    self.page_size = page_size.max(1);
    self
  }

  /// Start over from the first record, observing the current contents.
  pub fn restart(&mut self) {
    self.buffer.clear();
    self.after = None;
    self.exhausted = false;
  }

  fn fill(&mut self) -> Result<()> {
    let page = T::fetch_page(self.store, self.after.as_ref(), self.page_size)?;
    if page.len() < self.page_size {
      self.exhausted = true;
    }
    if let Some(last) = page.last() {
      self.after = Some(last.page_key());
    }
    self.buffer.extend(page);
    Ok(())
  }
}

impl<'a, S: LocalStore + ?Sized, T: Paged> Iterator for Cursor<'a, S, T> {
  type Item = Result<T>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.buffer.is_empty() && !self.exhausted {
      if let Err(e) = self.fill() {
        self.exhausted = true;
        return Some(Err(e));
      }
    }
    self.buffer.pop_front().map(Ok)
  }
}
