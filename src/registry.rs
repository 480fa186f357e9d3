//! Path-keyed registry of shared store handles.
//!
//! Opening the same directory twice would give two stores that overwrite
//! each other's index on save. A [`StoreRegistry`] hands out one shared
//! handle per directory instead. It is an ordinary value: create one, pass it
//! (or an `Arc` of it) to whoever opens stores, and drop entries explicitly
//! with [`StoreRegistry::remove`].

use std::{
    collections::HashMap,
    io,
    path::{Component, Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tracing::{debug, info};

/// Shared handle to a registered value.
pub type Shared<T> = Arc<Mutex<T>>;

/// One shared `T` per canonical directory path.
#[derive(Debug)]
pub struct StoreRegistry<T> {
    entries: Mutex<HashMap<PathBuf, Shared<T>>>,
}

impl<T> Default for StoreRegistry<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

/// Canonical form of `path`.
///
/// The longest existing ancestor is canonicalized (symlinks and `..`
/// resolved); the components below it, which do not exist yet, are
/// normalized lexically.
fn registry_key(path: &Path) -> io::Result<PathBuf> {
    let mut base = std::path::absolute(path)?;
    let mut tail = Vec::new();
    let mut key = loop {
        if let Ok(canonical) = base.canonicalize() {
            break canonical;
        }
        match base.components().next_back() {
            Some(last) => tail.push(last.as_os_str().to_os_string()),
            None => break base,
        }
        if !base.pop() {
            break base;
        }
    };
    for part in tail.into_iter().rev() {
        match Path::new(&part).components().next() {
            Some(Component::ParentDir) => {
                key.pop();
            }
            Some(Component::CurDir) | None => {}
            Some(_) => key.push(part),
        }
    }
    Ok(key)
}

impl<T> StoreRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PathBuf, Shared<T>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the handle registered for `path`, or opens one with `open`
    /// and registers it.
    ///
    /// `open` receives the canonical path. The registry stays locked while it
    /// runs, so two callers never open the same directory concurrently.
    pub fn get_or_insert_with<E>(
        &self,
        path: impl AsRef<Path>,
        open: impl FnOnce(&Path) -> Result<T, E>,
    ) -> Result<Shared<T>, E>
    where
        E: From<io::Error>,
    {
        let key = registry_key(path.as_ref())?;
        let mut entries = self.lock();
        if let Some(existing) = entries.get(&key) {
            debug!(path = %key.display(), "registry hit");
            return Ok(Arc::clone(existing));
        }
        let value = Arc::new(Mutex::new(open(&key)?));
        entries.insert(key.clone(), Arc::clone(&value));
        info!(path = %key.display(), "registered store");
        Ok(value)
    }

    pub fn get(&self, path: impl AsRef<Path>) -> Option<Shared<T>> {
        let key = registry_key(path.as_ref()).ok()?;
        self.lock().get(&key).cloned()
    }

    /// Unregisters `path`. Other holders keep their handle; the value is
    /// dropped with the last of them.
    pub fn remove(&self, path: impl AsRef<Path>) -> Option<Shared<T>> {
        let key = registry_key(path.as_ref()).ok()?;
        let removed = self.lock().remove(&key);
        if removed.is_some() {
            info!(path = %key.display(), "unregistered store");
        }
        removed
    }

    pub fn contains(&self, path: impl AsRef<Path>) -> bool {
        self.get(path).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Registered paths, in no particular order.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.lock().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn same_path_shares_one_value() {
        let tmp = TempDir::new().unwrap();
        let registry: StoreRegistry<u32> = StoreRegistry::new();
        let mut opened = 0;

        let a = registry
            .get_or_insert_with(tmp.path(), |_| {
                opened += 1;
                Ok::<_, io::Error>(1)
            })
            .unwrap();
        let b = registry
            .get_or_insert_with(tmp.path(), |_| {
                opened += 1;
                Ok::<_, io::Error>(2)
            })
            .unwrap();

        assert_eq!(opened, 1);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(*b.lock().unwrap(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn equivalent_spellings_map_to_one_entry() {
        let tmp = TempDir::new().unwrap();
        let registry: StoreRegistry<&'static str> = StoreRegistry::new();
        registry
            .get_or_insert_with(tmp.path(), |_| Ok::<_, io::Error>("first"))
            .unwrap();

        let dotted = tmp.path().join(".");
        let again = registry
            .get_or_insert_with(&dotted, |_| Ok::<_, io::Error>("second"))
            .unwrap();
        assert_eq!(*again.lock().unwrap(), "first");
    }

    #[test]
    fn parent_components_are_resolved() {
        let tmp = TempDir::new().unwrap();
        let store = tmp.path().join("store");
        std::fs::create_dir(&store).unwrap();
        let registry: StoreRegistry<u8> = StoreRegistry::new();
        registry
            .get_or_insert_with(&store, |_| Ok::<_, io::Error>(1))
            .unwrap();

        assert!(registry.contains(store.join("..").join("store")));
        assert!(registry.contains(tmp.path().join("missing").join("..").join("store")));
        assert_eq!(registry.paths(), vec![store.canonicalize().unwrap()]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn missing_directories_are_normalized_lexically() {
        let tmp = TempDir::new().unwrap();
        let registry: StoreRegistry<u8> = StoreRegistry::new();
        let fresh = tmp.path().join("not-yet").join("store");
        registry
            .get_or_insert_with(&fresh, |_| Ok::<_, io::Error>(1))
            .unwrap();

        let spelled = tmp.path().join("not-yet").join("x").join("..").join(".").join("store");
        assert!(registry.contains(&spelled));
        assert_eq!(
            registry.paths(),
            vec![tmp.path().canonicalize().unwrap().join("not-yet").join("store")]
        );
    }

    #[test]
    fn failed_open_registers_nothing() {
        let tmp = TempDir::new().unwrap();
        let registry: StoreRegistry<u32> = StoreRegistry::new();
        let err = registry
            .get_or_insert_with(tmp.path(), |_| {
                Err(io::Error::other("boom"))
            })
            .unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_keeps_outstanding_handles_alive() {
        let tmp = TempDir::new().unwrap();
        let registry: StoreRegistry<Vec<u8>> = StoreRegistry::new();
        let held = registry
            .get_or_insert_with(tmp.path(), |_| Ok::<_, io::Error>(vec![1, 2, 3]))
            .unwrap();

        let removed = registry.remove(tmp.path()).unwrap();
        assert!(Arc::ptr_eq(&held, &removed));
        assert!(!registry.contains(tmp.path()));
        assert_eq!(held.lock().unwrap().len(), 3);
    }

    #[test]
    fn concurrent_callers_open_once() {
        let tmp = TempDir::new().unwrap();
        let registry: Arc<StoreRegistry<usize>> = Arc::new(StoreRegistry::new());
        let opens = Arc::new(Mutex::new(0usize));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let opens = Arc::clone(&opens);
                let path = tmp.path().to_path_buf();
                thread::spawn(move || {
                    registry
                        .get_or_insert_with(&path, |_| {
                            *opens.lock().unwrap() += 1;
                            Ok::<_, io::Error>(42)
                        })
                        .unwrap()
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(*handle.join().unwrap().lock().unwrap(), 42);
        }
        assert_eq!(*opens.lock().unwrap(), 1);
    }
}
