//! Loading and managing plug-in objects from shared libraries.
//!
//! A plug-in library exports two C-linkage symbols for a type `Name`:
//! `create_Name`, returning a raw pointer to a newly allocated
//! instance, and `destroy_Name`, releasing it. The manager resolves
//! both, owns the created instance, and guarantees the destroy call
//! runs before the library handle is released.

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use libloading::Library;
use tracing::{debug, info};

use crate::error::Plugin as PluginKind;
use crate::{Error, Result};

/// Platform extension for plug-in libraries.
#[cfg(target_os = "macos")]
pub const PLUGIN_EXTENSION: &str = ".dylib";
/// Platform extension for plug-in libraries.
#[cfg(target_os = "windows")]
pub const PLUGIN_EXTENSION: &str = ".dll";
/// Platform extension for plug-in libraries.
#[cfg(not(any(target_os = "macos", target_os = "windows")))]
pub const PLUGIN_EXTENSION: &str = ".so";

const CREATE_PREFIX: &str = "create_";
const DESTROY_PREFIX: &str = "destroy_";

type CreateFn<T> = unsafe extern "C" fn() -> *mut T;
type DestroyFn<T> = unsafe extern "C" fn(*mut T);

/// An instance created by a plug-in library (or registered
/// statically). Dereferences to the plug-in object.
pub struct PluginInstance<T> {
    item: *mut T,
    destroy: Option<DestroyFn<T>>,
    // Dropped after the instance has been destroyed.
    _library: Option<Library>,
}

// The raw pointer is owned exclusively by this wrapper; sharing is as
// safe as sharing the pointee.
unsafe impl<T: Send> Send for PluginInstance<T> {}
unsafe impl<T: Sync> Sync for PluginInstance<T> {}

impl<T> Deref for PluginInstance<T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.item }
    }
}

impl<T> Drop for PluginInstance<T> {
    fn drop(&mut self) {
        match self.destroy {
            Some(destroy) => unsafe { destroy(self.item) },
            None => unsafe {
                drop(Box::from_raw(self.item));
            },
        }
    }
}

impl<T> fmt::Debug for PluginInstance<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginInstance")
            .field("loaded", &self._library.is_some())
            .finish()
    }
}

/// Manages a collection of plug-in objects keyed by identifier.
pub struct PluginManager<T> {
    plugins: Mutex<HashMap<String, Arc<PluginInstance<T>>>>,
    search_dirs: Mutex<Vec<PathBuf>>,
}

impl<T> fmt::Debug for PluginManager<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginManager")
            .field("plugins", &lock(&self.plugins).len())
            .finish()
    }
}

impl<T> Default for PluginManager<T> {
    fn default() -> Self {
        PluginManager::new()
    }
}

impl<T> PluginManager<T> {
    /// Creates an empty manager.
    pub fn new() -> PluginManager<T> {
        PluginManager {
            plugins: Mutex::new(HashMap::new()),
            search_dirs: Mutex::new(Vec::new()),
        }
    }

    /// Appends a directory to the plug-in search path.
    pub fn add_plugin_directory(&self, dir: impl Into<PathBuf>) -> Result<()> {
        let dir = dir.into();
        if !dir.is_dir() {
            return Err(Error::new_plugin(
                PluginKind::NotFound,
                format!("not a plug-in directory: {}", dir.display()),
            ));
        }
        lock(&self.search_dirs).push(dir);
        Ok(())
    }

    /// Registers an instance that was not loaded from a library.
    pub fn add(&self, plugin_id: impl Into<String>, instance: T) -> Result<Arc<PluginInstance<T>>> {
        let plugin_id = plugin_id.into();
        let instance = Arc::new(PluginInstance {
            item: Box::into_raw(Box::new(instance)),
            destroy: None,
            _library: None,
        });
        self.insert(plugin_id, Arc::clone(&instance))?;
        Ok(instance)
    }

    /// Loads a plug-in library by name, resolves its create/destroy
    /// symbols, and instantiates it under `plugin_id`.
    pub fn load(&self, plugin_id: impl Into<String>, name: &str) -> Result<Arc<PluginInstance<T>>> {
        let plugin_id = plugin_id.into();
        let path = self.find_plugin_file(name).ok_or_else(|| {
            Error::new_plugin(
                PluginKind::NotFound,
                format!("no plug-in library found for: {name}"),
            )
        })?;
        debug!(plugin = name, path = %path.display(), "loading plug-in");

        let library = unsafe { Library::new(&path) }.map_err(|e| {
            Error::new_plugin(
                PluginKind::Open,
                format!("{}: {e}", path.display()),
            )
        })?;

        let stem = plugin_stem(name);
        let create: CreateFn<T> = resolve(&library, &format!("{CREATE_PREFIX}{stem}"))?;
        let destroy: DestroyFn<T> = resolve(&library, &format!("{DESTROY_PREFIX}{stem}"))?;

        let item = unsafe { create() };
        if item.is_null() {
            return Err(Error::new_plugin(
                PluginKind::Symbol,
                format!("create_{stem} returned a null instance"),
            ));
        }
        let instance = Arc::new(PluginInstance {
            item,
            destroy: Some(destroy),
            _library: Some(library),
        });
        self.insert(plugin_id, Arc::clone(&instance))?;
        info!(plugin = name, "loaded plug-in");
        Ok(instance)
    }

    /// Finds the plug-in registered under `plugin_id`.
    pub fn find(&self, plugin_id: &str) -> Option<Arc<PluginInstance<T>>> {
        lock(&self.plugins).get(plugin_id).cloned()
    }

    /// Destroys the plug-in registered under `plugin_id` and unloads
    /// its library.
    pub fn remove(&self, plugin_id: &str) -> Result<()> {
        lock(&self.plugins).remove(plugin_id).map(|_| ()).ok_or_else(|| {
            Error::new_plugin(
                PluginKind::NotFound,
                format!("no plug-ins found for identifier: {plugin_id}"),
            )
        })
    }

    /// Removes every plug-in.
    pub fn clear(&self) {
        lock(&self.plugins).clear();
    }

    /// True when no plug-ins are registered.
    pub fn is_empty(&self) -> bool {
        lock(&self.plugins).is_empty()
    }

    /// Runs `f` for each registered plug-in.
    pub fn run(&self, mut f: impl FnMut(&str, &T)) {
        for (id, instance) in lock(&self.plugins).iter() {
            f(id, instance);
        }
    }

    fn insert(&self, plugin_id: String, instance: Arc<PluginInstance<T>>) -> Result<()> {
        let mut plugins = lock(&self.plugins);
        if plugins.contains_key(&plugin_id) {
            return Err(Error::new_plugin(
                PluginKind::Duplicate,
                format!("duplicate plug-in identifier: {plugin_id}"),
            ));
        }
        plugins.insert(plugin_id, instance);
        Ok(())
    }

    fn find_plugin_file(&self, name: &str) -> Option<PathBuf> {
        let raw = Path::new(name);
        if raw.is_file() {
            return Some(raw.to_path_buf());
        }
        let with_ext = PathBuf::from(format!("{name}{PLUGIN_EXTENSION}"));
        if with_ext.is_file() {
            return Some(with_ext);
        }
        for dir in lock(&self.search_dirs).iter() {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Some(candidate);
            }
            let candidate = dir.join(format!("{name}{PLUGIN_EXTENSION}"));
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        None
    }
}

fn resolve<F: Copy>(library: &Library, symbol: &str) -> Result<F> {
    let mut bytes = symbol.as_bytes().to_vec();
    bytes.push(0);
    unsafe {
        library
            .get::<F>(&bytes)
            .map(|s| *s)
            .map_err(|e| Error::new_plugin(PluginKind::Symbol, format!("{symbol}: {e}")))
    }
}

fn plugin_stem(name: &str) -> String {
    Path::new(name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
