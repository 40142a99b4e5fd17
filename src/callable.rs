//! Type-erased function container with small-buffer inlining.
//!
//! Job actions and readiness predicates are stored as [`Callable`]s. The
//! container erases any `Fn() -> R + Clone + Send` behind a hand-rolled
//! vtable and keeps captures of up to two machine words inline, so the
//! common case (a couple of `Arc`s) never touches the heap.

use std::fmt;
use std::marker::PhantomData;
use std::mem::{self, MaybeUninit};
use std::ptr;

/// Inline storage: two machine words, word-aligned. Closures that are larger
/// or more aligned than this are boxed and the box pointer lives in the
/// first word instead.
type InlineBuf = MaybeUninit<[usize; 2]>;

const fn fits_inline<F>() -> bool {
    mem::size_of::<F>() <= mem::size_of::<InlineBuf>()
        && mem::align_of::<F>() <= mem::align_of::<InlineBuf>()
}

struct Vtable<R> {
    call: unsafe fn(*const InlineBuf) -> R,
    clone: unsafe fn(*const InlineBuf, *mut InlineBuf),
    drop: unsafe fn(*mut InlineBuf),
    inlined: bool,
}

unsafe fn call_inline<R, F: Fn() -> R>(storage: *const InlineBuf) -> R {
    let target = &*(storage as *const F);
    target()
}

unsafe fn call_boxed<R, F: Fn() -> R>(storage: *const InlineBuf) -> R {
    let target = &**(storage as *const *mut F);
    target()
}

unsafe fn clone_inline<F: Clone>(src: *const InlineBuf, dst: *mut InlineBuf) {
    let target = &*(src as *const F);
    ptr::write(dst as *mut F, target.clone());
}

unsafe fn clone_boxed<F: Clone>(src: *const InlineBuf, dst: *mut InlineBuf) {
    let target = &*(*(src as *const *mut F));
    ptr::write(dst as *mut *mut F, Box::into_raw(Box::new(target.clone())));
}

unsafe fn drop_inline<F>(storage: *mut InlineBuf) {
    ptr::drop_in_place(storage as *mut F);
}

unsafe fn drop_boxed<F>(storage: *mut InlineBuf) {
    drop(Box::from_raw(*(storage as *mut *mut F)));
}

struct VtableHolder<R, F>(PhantomData<fn() -> (R, F)>);

impl<R: 'static, F> VtableHolder<R, F>
where
    F: Fn() -> R + Clone + Send + 'static,
{
    const INLINE: &'static Vtable<R> = &Vtable {
        call: call_inline::<R, F>,
        clone: clone_inline::<F>,
        drop: drop_inline::<F>,
        inlined: true,
    };

    const BOXED: &'static Vtable<R> = &Vtable {
        call: call_boxed::<R, F>,
        clone: clone_boxed::<F>,
        drop: drop_boxed::<F>,
        inlined: false,
    };
}

/// A clonable, movable, type-erased `Fn() -> R`.
///
/// Construct with [`Callable::new`], invoke with [`Callable::call`]. The
/// default value is empty; invoking an empty callable panics, which callers
/// guard against with [`Callable::is_populated`].
pub struct Callable<R: 'static = ()> {
    vtable: Option<&'static Vtable<R>>,
    storage: InlineBuf,
}

// Safety: the only way to populate the storage is `new`, which requires
// `F: Send`. `R` is produced by value on the invoking thread and never
// stored.
unsafe impl<R> Send for Callable<R> {}

impl<R> Callable<R> {
    pub fn new<F>(target: F) -> Self
    where
        F: Fn() -> R + Clone + Send + 'static,
    {
        let mut storage: InlineBuf = MaybeUninit::uninit();
        let vtable = if fits_inline::<F>() {
            // Safety: size and alignment checked by `fits_inline`.
            unsafe { ptr::write(storage.as_mut_ptr() as *mut F, target) };
            VtableHolder::<R, F>::INLINE
        } else {
            // Safety: a thin pointer always fits the buffer.
            unsafe {
                ptr::write(
                    storage.as_mut_ptr() as *mut *mut F,
                    Box::into_raw(Box::new(target)),
                )
            };
            VtableHolder::<R, F>::BOXED
        };

        Self {
            vtable: Some(vtable),
            storage,
        }
    }

    /// Invoke the stored target.
    ///
    /// # Panics
    ///
    /// Panics if the callable is empty.
    pub fn call(&self) -> R {
        let vtable = self.vtable.expect("invoked an empty Callable");
        // Safety: a populated callable's storage matches its vtable.
        unsafe { (vtable.call)(&self.storage) }
    }

    pub fn is_populated(&self) -> bool {
        self.vtable.is_some()
    }

    #[cfg(test)]
    fn is_inlined(&self) -> Option<bool> {
        self.vtable.map(|vtable| vtable.inlined)
    }
}

impl<R> Clone for Callable<R> {
    fn clone(&self) -> Self {
        match self.vtable {
            None => Self::default(),
            Some(vtable) => {
                let mut storage: InlineBuf = MaybeUninit::uninit();
                // Safety: source is populated and storage matches its vtable;
                // the clone fn initializes `storage` in the same mode.
                unsafe { (vtable.clone)(&self.storage, &mut storage) };
                Self {
                    vtable: Some(vtable),
                    storage,
                }
            }
        }
    }
}

impl<R> Drop for Callable<R> {
    fn drop(&mut self) {
        if let Some(vtable) = self.vtable {
            // Safety: a populated callable's storage matches its vtable.
            unsafe { (vtable.drop)(&mut self.storage) };
        }
    }
}

impl<R> Default for Callable<R> {
    fn default() -> Self {
        Self {
            vtable: None,
            storage: MaybeUninit::uninit(),
        }
    }
}

impl<R> fmt::Debug for Callable<R> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Callable")
            .field("populated", &self.is_populated())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    assert_impl_all!(Callable: Send, Clone, Default);
    assert_impl_all!(Callable<bool>: Send, Clone);

    #[test]
    fn test_small_closure_is_inlined() {
        let x = 7usize;
        let callable = Callable::new(move || x + 1);
        assert_eq!(callable.is_inlined(), Some(true));
        assert_eq!(callable.call(), 8);
    }

    #[test]
    fn test_two_word_capture_is_inlined() {
        let pair = (1usize, 2usize);
        let callable = Callable::new(move || pair.0 + pair.1);
        assert_eq!(callable.is_inlined(), Some(true));
        assert_eq!(callable.call(), 3);
    }

    #[test]
    fn test_large_capture_falls_back_to_heap() {
        let big = [1u64, 2, 3, 4];
        let callable = Callable::new(move || big.iter().sum::<u64>());
        assert_eq!(callable.is_inlined(), Some(false));
        assert_eq!(callable.call(), 10);
    }

    #[test]
    fn test_overaligned_capture_falls_back_to_heap() {
        let wide = 3u128;
        let callable = Callable::new(move || wide as u64);
        assert_eq!(callable.is_inlined(), Some(false));
        assert_eq!(callable.call(), 3);
    }

    #[test]
    fn test_clone_shares_captured_state() {
        let count = Arc::new(AtomicUsize::new(0));
        let captured = count.clone();
        let callable = Callable::new(move || {
            captured.fetch_add(1, Ordering::SeqCst);
        });

        let cloned = callable.clone();
        callable.call();
        cloned.call();
        cloned.call();

        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_clone_of_boxed_callable_allocates_anew() {
        let big = [9u64; 8];
        let callable = Callable::new(move || big[0]);
        let cloned = callable.clone();
        drop(callable);
        assert_eq!(cloned.call(), 9);
    }

    #[test]
    fn test_default_is_empty() {
        let callable: Callable<u32> = Callable::default();
        assert!(!callable.is_populated());
    }

    #[test]
    #[should_panic(expected = "empty Callable")]
    fn test_invoking_empty_callable_panics() {
        let callable: Callable = Callable::default();
        callable.call();
    }

    #[test]
    fn test_swap_exchanges_targets() {
        let mut a = Callable::new(|| 1u32);
        let mut b = Callable::new(|| 2u32);
        std::mem::swap(&mut a, &mut b);
        assert_eq!(a.call(), 2);
        assert_eq!(b.call(), 1);
    }

    #[test]
    fn test_predicate_signature() {
        let flag = Arc::new(AtomicUsize::new(0));
        let captured = flag.clone();
        let predicate: Callable<bool> = Callable::new(move || captured.load(Ordering::SeqCst) > 0);

        assert!(!predicate.call());
        flag.store(1, Ordering::SeqCst);
        assert!(predicate.call());
    }
}
