//! Finalizers.
//!
//! A registration is a list cell on a registry rooted in the heap: its car
//! is the watched object, its tag the finalizer, and its gp bit means
//! "eligible to run". After the main mark of each collection, any watched
//! object that failed to survive gets its entry flagged, and the registry
//! itself is then forwarded, so a finalizer-only-reachable object lives
//! exactly one collection longer than its last real reference.
//!
//! Finalizers run after reclamation, in registration order. Each entry is
//! detached before its finalizer is invoked, so a finalizer runs at most
//! once no matter what it does, including failing or re-entering the
//! collector by allocating.

use crate::atom::{char_data, Atom, Tag};
use crate::error::Error;
use crate::gengc::Heap;
use std::mem;
use std::ptr;

/// A native finalizer: called with the watched object once it has become
/// unreachable. Stored in a character-string node, the same way any other
/// opaque byte payload is.
pub type NativeFinalizer = fn(*mut Atom);

unsafe fn native_finalizer_of(fun: *mut Atom) -> NativeFinalizer {
    ptr::read(char_data(fun) as *const NativeFinalizer)
}

fn is_native_finalizer(heap: &Heap, fun: *mut Atom) -> bool {
    heap.tag_of(fun) == Tag::Char
}

impl Heap {
    fn check_finalizer_target(&self, obj: *mut Atom) -> Result<(), Error> {
        match self.tag_of(obj) {
            Tag::Env | Tag::ExtPtr => Ok(()),
            got => Err(error!(BadFinalizerTarget, got)),
        }
    }

    /// Watch `obj` and call `fun` on it after it becomes unreachable. The
    /// object must be an environment or an external pointer, the function a
    /// closure, builtin, or special.
    pub fn register_finalizer(&mut self, obj: *mut Atom, fun: *mut Atom)
                              -> Result<(), Error> {
        self.check_finalizer_target(obj)?;
        match self.tag_of(fun) {
            Tag::Closure | Tag::Builtin | Tag::Special => (),
            got => return err!(BadFinalizerFun, got),
        }
        let watch = self.fin_watch;
        let cell = self.cons(obj, watch)?;
        self.fin_watch = cell;
        self.set_tag(cell, fun);
        unsafe { (*cell).meta.set_gp(0) }
        Ok(())
    }

    /// Watch `obj` with a native finalizer. The function pointer is stowed
    /// in a character-string node so the registry only ever holds heap
    /// references.
    pub fn register_native_finalizer(&mut self, obj: *mut Atom,
                                     fun: NativeFinalizer) -> Result<(), Error> {
        self.check_finalizer_target(obj)?;
        // Protect obj: until the tag is in place its only link visible to
        // the collector might be the registry entry itself, and the entry
        // must not be flagged as eligible by an intervening collection.
        self.protect(obj)?;
        let res = (|| {
            let watch = self.fin_watch;
            let cell = self.cons(obj, watch)?;
            self.fin_watch = cell;
            let s = self.alloc_string(mem::size_of::<NativeFinalizer>() as isize)?;
            unsafe { ptr::write(char_data(s) as *mut NativeFinalizer, fun) }
            self.set_tag(cell, s);
            unsafe { (*cell).meta.set_gp(0) }
            Ok(())
        })();
        let _ = self.unprotect(1);
        res
    }

    /// After the main mark: flag every registration whose object did not
    /// survive on its own and is not yet flagged.
    pub(crate) fn check_finalizers(&mut self) {
        unsafe {
            let mut s = self.fin_watch;
            while s != self.nil() {
                let obj = (*s).car();
                if !(*obj).meta().is_marked() && (*s).meta.gp() == 0 {
                    (*s).meta.set_gp(1);
                }
                s = (*s).cdr();
            }
        }
    }

    /// Run every flagged registration. Returns whether any finalizer ran.
    pub(crate) fn run_finalizers(&mut self) -> bool {
        let mut finalizer_run = false;
        unsafe {
            let nil = self.nil();
            let mut last = nil;
            let mut s = self.fin_watch;
            while s != nil {
                let next = (*s).cdr();
                if (*s).meta.gp() != 0 {
                    finalizer_run = true;

                    // Detach the entry first: even a failing finalizer must
                    // never run twice. Clearing the flag keeps a reentrant
                    // collection from picking the detached entry up again.
                    if last == nil {
                        self.fin_watch = next;
                    } else {
                        let _ = self.set_cdr(last, next);
                    }
                    (*s).meta.set_gp(0);

                    // A fresh top-level context: save what the finalizer
                    // could clobber, restore it on every exit path.
                    let top_exp = self.current_expr();
                    let _ = self.protect(top_exp);
                    let savestack = self.protect_len();

                    let _ = self.protect(s);
                    let val = (*s).car();
                    let fun = (*s).cell_tag();
                    if is_native_finalizer(self, fun) {
                        let cfun = native_finalizer_of(fun);
                        cfun(val);
                    } else {
                        match self.finalizer_call(fun, val) {
                            Ok(e) => {
                                let _ = self.protect(e);
                                let genv = self.global_env();
                                match self.eval_hook {
                                    Some(hook) => {
                                        if let Err(err) = hook(self, e, genv) {
                                            warn!("finalizer error: {}", err);
                                        }
                                    }
                                    None => warn!("finalizer dropped: no \
                                                   evaluation hook registered"),
                                }
                            }
                            Err(err) => warn!("finalizer error: {}", err),
                        }
                    }

                    self.truncate_protect(savestack);
                    self.set_current_expr(top_exp);
                    let _ = self.unprotect(1);
                } else {
                    last = s;
                }
                s = next;
            }
        }
        finalizer_run
    }

    /// Build the call `(fun obj)` as language cells.
    fn finalizer_call(&mut self, fun: *mut Atom, val: *mut Atom)
                      -> Result<*mut Atom, Error> {
        let args = self.cons(val, self.nil())?;
        unsafe { (*args).meta.set_typ(Tag::Lang as u8) }
        let e = self.cons(fun, args)?;
        unsafe { (*e).meta.set_typ(Tag::Lang as u8) }
        Ok(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::gengc::Heap;
    use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};

    static ONCE_HITS: AtomicUsize = AtomicUsize::new(0);

    fn once_fin(obj: *mut Atom) {
        unsafe {
            assert_eq!((*obj).tag_of(), Tag::Env);
        }
        ONCE_HITS.fetch_add(1, SeqCst);
    }

    #[test]
    fn native_finalizer_runs_at_most_once() {
        let mut h = Heap::default();
        let obj = h.alloc_node(Tag::Env).unwrap();
        h.register_native_finalizer(obj, once_fin).unwrap();
        assert_eq!(ONCE_HITS.load(SeqCst), 0);
        h.gc();
        assert_eq!(ONCE_HITS.load(SeqCst), 1);
        h.gc();
        h.gc();
        assert_eq!(ONCE_HITS.load(SeqCst), 1);
        h.check_integrity();
    }

    static PROBE_HITS: AtomicUsize = AtomicUsize::new(0);

    fn probe_fin(obj: *mut Atom) {
        // The watched object must still be fully intact when its finalizer
        // runs, even though nothing else references it anymore.
        unsafe {
            assert_eq!((*obj).tag_of(), Tag::ExtPtr);
        }
        PROBE_HITS.fetch_add(1, SeqCst);
    }

    #[test]
    fn finalizer_sees_live_object() {
        let mut h = Heap::default();
        let tag = h.mk_char("handle").unwrap();
        let obj = h.mk_extptr(ptr::null_mut(), tag, h.nil()).unwrap();
        h.register_native_finalizer(obj, probe_fin).unwrap();
        h.gc();
        assert_eq!(PROBE_HITS.load(SeqCst), 1);
    }

    #[test]
    fn protected_object_is_not_finalized() {
        static HITS: AtomicUsize = AtomicUsize::new(0);
        fn fin(_obj: *mut Atom) {
            HITS.fetch_add(1, SeqCst);
        }
        let mut h = Heap::default();
        let obj = h.alloc_node(Tag::Env).unwrap();
        h.protect(obj).unwrap();
        h.register_native_finalizer(obj, fin).unwrap();
        h.gc();
        h.gc();
        assert_eq!(HITS.load(SeqCst), 0);
        h.unprotect(1).unwrap();
        h.gc();
        assert_eq!(HITS.load(SeqCst), 1);
    }

    static EVAL_CALLS: AtomicUsize = AtomicUsize::new(0);

    fn recording_hook(h: &mut Heap, e: *mut Atom, env: *mut Atom)
                      -> Result<*mut Atom, Error> {
        // The call is (fun obj) as language cells, evaluated in the global
        // environment.
        assert_eq!(h.tag_of(e), Tag::Lang);
        assert_eq!(h.tag_of(h.car(e)), Tag::Closure);
        assert_eq!(h.tag_of(h.cadr(e)), Tag::Env);
        assert_eq!(env, h.global_env());
        EVAL_CALLS.fetch_add(1, SeqCst);
        Ok(h.nil())
    }

    #[test]
    fn callable_finalizer_goes_through_the_hook() {
        let mut h = Heap::default();
        h.set_eval_hook(recording_hook);
        let fun = h.alloc_node(Tag::Closure).unwrap();
        h.preserve(fun).unwrap();
        let obj = h.alloc_node(Tag::Env).unwrap();
        h.register_finalizer(obj, fun).unwrap();
        h.gc();
        assert_eq!(EVAL_CALLS.load(SeqCst), 1);
        h.gc();
        assert_eq!(EVAL_CALLS.load(SeqCst), 1);
    }

    #[test]
    fn registration_validates_types() {
        fn noop(_obj: *mut Atom) {}
        let mut h = Heap::default();
        let not_ref = h.mk_char("x").unwrap();
        let fun = h.alloc_node(Tag::Closure).unwrap();

        let e = h.register_finalizer(not_ref, fun).unwrap_err();
        assert!(matches!(e.ty, ErrorKind::BadFinalizerTarget { .. }));
        let env = h.alloc_node(Tag::Env).unwrap();
        let e = h.register_finalizer(env, not_ref).unwrap_err();
        assert!(matches!(e.ty, ErrorKind::BadFinalizerFun { .. }));
        let e = h.register_native_finalizer(not_ref, noop).unwrap_err();
        assert!(matches!(e.ty, ErrorKind::BadFinalizerTarget { .. }));
    }

    fn failing_hook(h: &mut Heap, _e: *mut Atom, _env: *mut Atom)
                    -> Result<*mut Atom, Error> {
        // Misbehave on purpose: allocate, leave a protect imbalance, fail.
        let x = h.cons(h.nil(), h.nil())?;
        h.protect(x)?;
        err!(SomeError, msg: "deliberate finalizer failure".to_string())
    }

    #[test]
    fn finalizer_errors_are_contained() {
        let mut h = Heap::default();
        h.set_eval_hook(failing_hook);
        let marker = h.cons(h.nil(), h.nil()).unwrap();
        h.preserve(marker).unwrap();
        h.set_current_expr(marker);

        let fun = h.alloc_node(Tag::Closure).unwrap();
        h.preserve(fun).unwrap();
        let obj = h.alloc_node(Tag::Env).unwrap();
        h.register_finalizer(obj, fun).unwrap();

        let depth = h.protect_len();
        h.gc();
        // The imbalance and the error stayed inside the finalizer context.
        assert_eq!(h.protect_len(), depth);
        assert_eq!(h.current_expr(), marker);
        h.gc();
        h.cons(h.nil(), h.nil()).unwrap();
        h.check_integrity();
    }

    static REENTRANT_CALLS: AtomicUsize = AtomicUsize::new(0);

    fn reentrant_hook(h: &mut Heap, _e: *mut Atom, _env: *mut Atom)
                      -> Result<*mut Atom, Error> {
        REENTRANT_CALLS.fetch_add(1, SeqCst);
        // Allocate and force a nested collection from inside the finalizer.
        for _ in 0..10 {
            h.cons(h.nil(), h.nil())?;
        }
        h.gc();
        Ok(h.nil())
    }

    #[test]
    fn reentrant_collection_keeps_at_most_once() {
        let mut h = Heap::default();
        h.set_eval_hook(reentrant_hook);
        let fun = h.alloc_node(Tag::Closure).unwrap();
        h.preserve(fun).unwrap();
        let a = h.alloc_node(Tag::Env).unwrap();
        h.protect(a).unwrap();
        let b = h.alloc_node(Tag::Env).unwrap();
        h.register_finalizer(a, fun).unwrap();
        h.register_finalizer(b, fun).unwrap();
        h.unprotect(1).unwrap();

        // Both objects are dead; the first finalizer's nested collection
        // may run the second, but neither may run twice.
        h.gc();
        assert_eq!(REENTRANT_CALLS.load(SeqCst), 2);
        h.gc();
        h.gc();
        assert_eq!(REENTRANT_CALLS.load(SeqCst), 2);
        h.check_integrity();
    }
}
