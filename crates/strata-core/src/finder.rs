//! # Finder Registries
//!
//! Type and object lookups are answered by a list of named finders, tried
//! newest first until one produces a result. The debug-info index registers
//! itself here; callers can add their own finders in front of it.
//!
//! Registration hands back a [`Registration`] guard. Dropping the guard removes
//! the finder again unless [`Registration::keep`] was called, so a multi-step
//! setup that fails halfway does not leave half of itself registered.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::trace;

use crate::error::{Result, StrataError};
use crate::object::{FindObjectFlags, Object};
use crate::types::{Type, TypeKind};

/// Finds types by name
pub trait TypeFinder: Send + Sync
{
    /// Look up a type. `kind` is the tag keyword of the name, `None` for
    /// untagged names such as `int` or a typedef. Return `Ok(None)` for a miss.
    fn find_type(&self, kind: Option<TypeKind>, name: &str, filename: Option<&str>) -> Result<Option<Arc<Type>>>;
}

/// Finds functions, variables and constants by name
pub trait ObjectFinder: Send + Sync
{
    /// Look up an object and fill in `out`. Return `Ok(false)` for a miss.
    fn find_object(&self, name: &str, filename: Option<&str>, flags: FindObjectFlags, out: &mut Object)
    -> Result<bool>;
}

struct Entry<F: ?Sized>
{
    name: String,
    finder: Arc<F>,
}

/// Named finders, newest first
pub struct FinderIndex<F: ?Sized>
{
    entries: RwLock<Vec<Entry<F>>>,
}

/// Type finders of a program
pub type TypeIndex = FinderIndex<dyn TypeFinder>;

/// Object finders of a program
pub type ObjectIndex = FinderIndex<dyn ObjectFinder>;

impl<F: ?Sized> Default for FinderIndex<F>
{
    fn default() -> Self
    {
        FinderIndex {
            entries: RwLock::new(Vec::new()),
        }
    }
}

impl<F: ?Sized> fmt::Debug for FinderIndex<F>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("FinderIndex").field("names", &self.names()).finish()
    }
}

impl<F: ?Sized> FinderIndex<F>
{
    /// Create an empty registry.
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Register `finder` under `name`, in front of every existing finder.
    ///
    /// The finder stays registered only if the returned guard is kept.
    ///
    /// ## Errors
    ///
    /// `InvalidArgument` if `name` is already registered.
    pub fn register(&self, name: impl Into<String>, finder: Arc<F>) -> Result<Registration<'_, F>>
    {
        let name = name.into();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.iter().any(|entry| entry.name == name) {
            return Err(StrataError::InvalidArgument(format!("duplicate finder name '{name}'")));
        }
        trace!(finder = %name, "registering finder");
        entries.insert(
            0,
            Entry {
                name: name.clone(),
                finder,
            },
        );
        Ok(Registration {
            index: self,
            name,
            active: true,
        })
    }

    /// Register `finder` permanently.
    ///
    /// ## Errors
    ///
    /// `InvalidArgument` if `name` is already registered.
    pub fn add(&self, name: impl Into<String>, finder: Arc<F>) -> Result<()>
    {
        self.register(name, finder)?.keep();
        Ok(())
    }

    /// Remove the finder registered under `name`. Returns whether one was.
    pub fn remove(&self, name: &str) -> bool
    {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|entry| entry.name != name);
        entries.len() != before
    }

    /// Registered names, newest first.
    pub fn names(&self) -> Vec<String>
    {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.iter().map(|entry| entry.name.clone()).collect()
    }

    /// Number of registered finders.
    pub fn len(&self) -> usize
    {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no finder is registered.
    pub fn is_empty(&self) -> bool
    {
        self.len() == 0
    }

    // Finders may call back into the registry (lazy type resolution does), so
    // they run on a snapshot with the lock released.
    fn snapshot(&self) -> Vec<Arc<F>>
    {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.iter().map(|entry| Arc::clone(&entry.finder)).collect()
    }
}

impl FinderIndex<dyn TypeFinder>
{
    /// Ask each finder in turn for a type.
    ///
    /// ## Errors
    ///
    /// `Lookup` if no finder knows the type; the first finder error otherwise.
    pub fn find(&self, kind: Option<TypeKind>, name: &str, filename: Option<&str>) -> Result<Arc<Type>>
    {
        for finder in self.snapshot() {
            if let Some(ty) = finder.find_type(kind, name, filename)? {
                return Ok(ty);
            }
        }
        let spelled = match kind.and_then(TypeKind::keyword) {
            Some(keyword) => format!("{keyword} {name}"),
            None => name.to_string(),
        };
        Err(StrataError::Lookup(match filename {
            Some(filename) => format!("could not find '{spelled}' in '{filename}'"),
            None => format!("could not find '{spelled}'"),
        }))
    }
}

impl FinderIndex<dyn ObjectFinder>
{
    /// Ask each finder in turn for an object.
    ///
    /// ## Errors
    ///
    /// `Lookup` if no finder knows the object; the first finder error otherwise.
    pub fn find(&self, name: &str, filename: Option<&str>, flags: FindObjectFlags, out: &mut Object) -> Result<()>
    {
        for finder in self.snapshot() {
            if finder.find_object(name, filename, flags, out)? {
                return Ok(());
            }
        }
        Err(StrataError::Lookup(match filename {
            Some(filename) => format!("could not find '{name}' in '{filename}'"),
            None => format!("could not find '{name}'"),
        }))
    }
}

/// Keeps a finder registered
///
/// Dropping the guard unregisters the finder; [`Registration::keep`] makes the
/// registration permanent.
#[must_use = "dropping the registration unregisters the finder"]
pub struct Registration<'a, F: ?Sized>
{
    index: &'a FinderIndex<F>,
    name: String,
    active: bool,
}

impl<F: ?Sized> Registration<'_, F>
{
    /// Name the finder is registered under.
    pub fn name(&self) -> &str
    {
        &self.name
    }

    /// Leave the finder registered.
    pub fn keep(mut self)
    {
        self.active = false;
    }
}

impl<F: ?Sized> Drop for Registration<'_, F>
{
    fn drop(&mut self)
    {
        if self.active {
            trace!(finder = %self.name, "rolling back finder registration");
            self.index.remove(&self.name);
        }
    }
}
