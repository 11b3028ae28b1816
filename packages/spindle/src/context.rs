//! Coroutine contexts.
//!
//! A [`Context`] is an immutable set of capability elements, keyed by the element's Rust type.
//! Combining two contexts never mutates either: it produces a new context in which the
//! right-hand side wins on key collision.

use smallvec::SmallVec;
use std::{
    any::{Any, TypeId, type_name},
    borrow::Cow,
    cell::RefCell,
    fmt::{self, Debug, Display, Formatter},
    future::Future,
    marker::PhantomData,
    ops::Add,
    pin::Pin,
    sync::Arc,
    task::{self, Poll},
};


/// Type that can be stored in a [`Context`]
///
/// An element's type is its key: a context holds at most one element of any given type.
pub trait Element: Any + Send + Sync + Debug {}

// object-safe view of an element.
trait AnyElement: Send + Sync + Debug {
    fn as_any(&self) -> &dyn Any;
}

impl<E: Element> AnyElement for E {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

// element storage slot.
#[derive(Clone)]
struct Entry {
    key: TypeId,
    name: &'static str,
    elem: Arc<dyn AnyElement>,
}

// contexts rarely hold more than a job, a dispatcher, and a name.
type Entries = SmallVec<[Entry; 4]>;

/// Immutable, associative set of coroutine capability elements
///
/// Cheap to clone. The empty context does not allocate.
#[derive(Clone, Default)]
pub struct Context(Option<Arc<Entries>>);

thread_local! {
    // the context of the resumption currently running on this thread.
    static CURRENT: RefCell<Context> = const { RefCell::new(Context(None)) };
}

impl Context {
    /// Construct the empty context
    pub const fn empty() -> Self {
        Context(None)
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Whether there are no elements
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entries(&self) -> &[Entry] {
        self.0.as_deref().map(|entries| entries.as_slice()).unwrap_or(&[])
    }

    /// Get the element of type `E`, if present
    pub fn get<E: Element>(&self) -> Option<&E> {
        let key = TypeId::of::<E>();
        self.entries().iter()
            .find(|entry| entry.key == key)
            .and_then(|entry| entry.elem.as_any().downcast_ref())
    }

    /// Whether an element of type `E` is present
    pub fn contains<E: Element>(&self) -> bool {
        let key = TypeId::of::<E>();
        self.entries().iter().any(|entry| entry.key == key)
    }

    /// Construct a new context with `elem` added, replacing any existing element of its type
    pub fn with<E: Element>(&self, elem: E) -> Self {
        let entry = Entry {
            key: TypeId::of::<E>(),
            name: type_name::<E>(),
            elem: Arc::new(elem),
        };
        let mut entries: Entries = self.entries().iter().cloned().collect();
        upsert(&mut entries, entry);
        Context(Some(Arc::new(entries)))
    }

    /// Construct a new context with the element of type `E` removed
    pub fn without<E: Element>(&self) -> Self {
        if !self.contains::<E>() {
            return self.clone();
        }
        let key = TypeId::of::<E>();
        let entries: Entries = self.entries().iter()
            .filter(|entry| entry.key != key)
            .cloned()
            .collect();
        if entries.is_empty() {
            Context(None)
        } else {
            Context(Some(Arc::new(entries)))
        }
    }

    /// Combine with another context, with `other`'s elements overriding this one's on conflict
    pub fn merge(&self, other: &Context) -> Self {
        if other.is_empty() {
            return self.clone();
        }
        if self.is_empty() {
            return other.clone();
        }
        let mut entries: Entries = self.entries().iter().cloned().collect();
        for entry in other.entries() {
            upsert(&mut entries, entry.clone());
        }
        Context(Some(Arc::new(entries)))
    }

    /// Whether two contexts are the same allocation
    pub fn ptr_eq(&self, other: &Context) -> bool {
        match (&self.0, &other.0) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }

    /// Clone the context of the resumption currently running on this thread
    ///
    /// Returns the empty context if nothing has entered a context on this thread.
    pub fn current() -> Self {
        CURRENT.try_with(|current| current.borrow().clone()).unwrap_or_default()
    }

    /// Make this the current context on this thread until the returned guard is dropped
    ///
    /// Guards restore whatever context was current before, including when dropped during
    /// unwinding. Guards must be dropped in reverse order of creation.
    pub fn enter(&self) -> ContextGuard {
        let prev = CURRENT.with(|current| current.replace(self.clone()));
        ContextGuard { prev: Some(prev), _not_send: PhantomData }
    }

    /// Wrap a future so that this context is current whenever it is polled
    pub fn scope<F: Future>(self, fut: F) -> Scoped<F> {
        Scoped { context: self, fut }
    }

    /// The [`CoroutineName`] element, if present
    pub fn name(&self) -> Option<&CoroutineName> {
        self.get()
    }
}

// insert entry, replacing an existing entry with the same key in place.
fn upsert(entries: &mut Entries, entry: Entry) {
    if let Some(slot) = entries.iter_mut().find(|slot| slot.key == entry.key) {
        *slot = entry;
    } else {
        entries.push(entry);
    }
}

impl Add<&Context> for &Context {
    type Output = Context;

    fn add(self, rhs: &Context) -> Context {
        self.merge(rhs)
    }
}

impl Add for Context {
    type Output = Context;

    fn add(self, rhs: Context) -> Context {
        self.merge(&rhs)
    }
}

impl Debug for Context {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let mut f = f.debug_map();
        for entry in self.entries() {
            f.entry(&entry.name, &entry.elem);
        }
        f.finish()
    }
}


/// Guard returned by [`Context::enter`]
///
/// Not `Send`: it restores thread-local state on the thread that created it.
pub struct ContextGuard {
    prev: Option<Context>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        if let Some(prev) = self.prev.take() {
            // thread-local may already be destroyed during thread teardown
            let _ = CURRENT.try_with(|current| *current.borrow_mut() = prev);
        }
    }
}


/// Future returned by [`Context::scope`]
pub struct Scoped<F> {
    context: Context,
    fut: F,
}

impl<F> Scoped<F> {
    /// The context this future is polled in
    pub fn context(&self) -> &Context {
        &self.context
    }
}

impl<F: Future> Future for Scoped<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut task::Context) -> Poll<F::Output> {
        unsafe {
            // safety: fut is structurally pinned. context is never moved out of.
            let this = self.get_unchecked_mut();
            let _guard = this.context.enter();
            Pin::new_unchecked(&mut this.fut).poll(cx)
        }
    }
}


/// Human-readable coroutine name, used for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CoroutineName(pub Cow<'static, str>);

impl CoroutineName {
    /// Construct from a string
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        CoroutineName(name.into())
    }
}

impl Display for CoroutineName {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Element for CoroutineName {}
