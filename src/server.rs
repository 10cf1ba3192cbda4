use crate::body::BodyControl;
use crate::clock::{Clock, SystemClock};
use crate::complex::FileComplex;
use crate::error::Result;
use crate::id::DocId;
use crate::store::FileStore;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Maps document ids to their live [`FileComplex`]es.
///
/// The map holds weak references: when the last session drops its handle
/// the complex is reclaimed, and the next access re-opens the file and
/// revalidates, indistinguishably from a first open. Dead entries are
/// pruned whenever the map is touched.
pub struct DocServer {
    store: Arc<dyn FileStore>,
    clock: Arc<dyn Clock>,
    complexes: Mutex<HashMap<DocId, Weak<FileComplex>>>,
}

impl DocServer {
    /// Creates a server over a file store, on the system clock.
    pub fn new(store: Arc<dyn FileStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    /// Creates a server with an injected clock.
    pub fn with_clock(store: Arc<dyn FileStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            complexes: Mutex::new(HashMap::new()),
        }
    }

    /// The live complex for `doc_id`, building one on a cache miss.
    pub async fn get_file_complex(&self, doc_id: &DocId) -> Result<Arc<FileComplex>> {
        if let Some(complex) = self.lookup(doc_id) {
            return Ok(complex);
        }
        let file = self.store.open(doc_id).await?;
        let complex = Arc::new(FileComplex::new(file, self.clock.clone()));
        let mut map = self.complexes.lock();
        // a concurrent caller may have built one while the file was opening
        if let Some(existing) = map.get(doc_id).and_then(Weak::upgrade) {
            return Ok(existing);
        }
        map.retain(|_, weak| weak.strong_count() > 0);
        map.insert(doc_id.clone(), Arc::downgrade(&complex));
        Ok(complex)
    }

    fn lookup(&self, doc_id: &DocId) -> Option<Arc<FileComplex>> {
        self.complexes.lock().get(doc_id).and_then(Weak::upgrade)
    }

    /// Forces bootstrap of `doc_id` and returns its body control.
    ///
    /// The control works standalone; callers that want to keep the
    /// document's caches warm hold the [`FileComplex`] from
    /// [`get_file_complex`](Self::get_file_complex) as well.
    pub async fn get_doc(&self, doc_id: &DocId) -> Result<BodyControl> {
        let complex = self.get_file_complex(doc_id).await?;
        complex.init().await?;
        complex.body()
    }

    /// Like [`get_doc`](Self::get_doc), but `None` when the underlying
    /// file does not exist.
    pub async fn get_doc_or_null(&self, doc_id: &DocId) -> Result<Option<BodyControl>> {
        let complex = self.get_file_complex(doc_id).await?;
        if !complex.access().file.exists().await? {
            return Ok(None);
        }
        complex.init().await?;
        complex.body().map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryFileStore;

    fn server() -> DocServer {
        crate::init_test_logging();
        DocServer::new(Arc::new(MemoryFileStore::new()))
    }

    #[async_std::test]
    async fn get_doc_bootstraps_a_new_document() {
        let server = server();
        let body = server.get_doc(&"doc-1".into()).await.unwrap();
        assert_eq!(body.current_rev_num().await.unwrap(), 1);
        let text = body
            .get_snapshot(None)
            .await
            .unwrap()
            .contents
            .document_text();
        assert!(text.contains("Welcome"), "unexpected preamble {text:?}");
    }

    #[async_std::test]
    async fn get_doc_or_null_distinguishes_missing_files() {
        let server = server();
        assert!(server
            .get_doc_or_null(&"doc-1".into())
            .await
            .unwrap()
            .is_none());
        server.get_doc(&"doc-1".into()).await.unwrap();
        assert!(server
            .get_doc_or_null(&"doc-1".into())
            .await
            .unwrap()
            .is_some());
        assert!(server
            .get_doc_or_null(&"doc-2".into())
            .await
            .unwrap()
            .is_none());
    }

    #[async_std::test]
    async fn live_complexes_are_shared_and_reclaimed() {
        let server = server();
        let id: DocId = "doc-1".into();
        let first = server.get_file_complex(&id).await.unwrap();
        let second = server.get_file_complex(&id).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        first.init().await.unwrap();
        let edited = first.body().unwrap();
        drop((first, second));

        // the weak entry is dead; the next access reopens and revalidates
        let reopened = server.get_file_complex(&id).await.unwrap();
        reopened.init().await.unwrap();
        assert_eq!(
            reopened.body().unwrap().current_rev_num().await.unwrap(),
            edited.current_rev_num().await.unwrap()
        );
    }
}
