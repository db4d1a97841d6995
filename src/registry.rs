// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Single-use tokens for carrying Rust closures through a C ABI.

Native code cannot hold a reference to a closure.  Instead we park the closure in a
[`HandleRegistry`] and hand native code a [`Token`], which fits in the pointer-sized
`context` parameter every callback-style C API offers.  When native code calls back,
the token is resolved to the original value and released in the same step.

The registry is a slot table with a free list.  Every slot carries a generation counter
that advances on release, so a stale token (double resolve, or a token forged by native
code) never matches a live slot even after the slot is reused.

```
use pixel_readback::registry::HandleRegistry;

let registry = HandleRegistry::new();
let token = registry.allocate("hello");
assert_eq!(registry.resolve_and_release(token).unwrap(), "hello");
assert!(registry.resolve_and_release(token).is_err());
```
*/

use crate::Error;
use crate::bittricks::{HALF_MASK, halves_to_usize, usize_to_halves};
use std::ffi::c_void;
use std::fmt::{Debug, Formatter};
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Opaque single-use handle for one registry entry.
///
/// Never zero, so a null context pointer is never a valid token.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(NonZeroUsize);

impl Token {
    fn new(generation: usize, index: usize) -> Token {
        let packed = halves_to_usize(generation, index);
        //generation is never zero, so neither is packed
        Token(NonZeroUsize::new(packed).unwrap_or(NonZeroUsize::MIN))
    }

    fn generation(self) -> usize {
        usize_to_halves(self.0.get()).0
    }

    fn index(self) -> usize {
        usize_to_halves(self.0.get()).1
    }

    pub fn as_raw(self) -> usize {
        self.0.get()
    }

    pub fn from_raw(raw: usize) -> Option<Token> {
        NonZeroUsize::new(raw).map(Token)
    }

    /// The token as a C `void *context` argument.
    pub fn into_context(self) -> *mut c_void {
        self.0.get() as *mut c_void
    }

    /// Recovers a token from a C `void *context` argument.
    pub fn from_context(context: *mut c_void) -> Option<Token> {
        Token::from_raw(context as usize)
    }

    /// The token as a JNI `long` argument.
    pub fn into_jlong(self) -> i64 {
        self.0.get() as i64
    }

    pub fn from_jlong(context: i64) -> Option<Token> {
        Token::from_raw(context as usize)
    }
}

impl Debug for Token {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("index", &self.index())
            .field("generation", &self.generation())
            .finish()
    }
}

#[derive(Debug)]
struct Slot<H> {
    generation: usize,
    value: Option<H>,
}

#[derive(Debug)]
struct Slots<H> {
    entries: Vec<Slot<H>>,
    free: Vec<usize>,
    live: usize,
}

/// Slot table mapping live [`Token`]s to values.
pub struct HandleRegistry<H> {
    slots: Mutex<Slots<H>>,
}

impl<H> HandleRegistry<H> {
    pub const fn new() -> Self {
        HandleRegistry {
            slots: Mutex::new(Slots {
                entries: Vec::new(),
                free: Vec::new(),
                live: 0,
            }),
        }
    }

    fn slots(&self) -> MutexGuard<'_, Slots<H>> {
        //a panicking holder can't leave the table half-updated; every write is a single step
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /**
    Parks `value` and returns a token unique among live tokens.

    # Panics
    If every index representable in half a `usize` is live at once.
    */
    pub fn allocate(&self, value: H) -> Token {
        let mut slots = self.slots();
        let index = match slots.free.pop() {
            Some(index) => index,
            None => {
                let index = slots.entries.len();
                assert!(
                    index <= HALF_MASK,
                    "HandleRegistry exhausted with {index} live tokens"
                );
                slots.entries.push(Slot {
                    generation: 1,
                    value: None,
                });
                index
            }
        };
        let slot = &mut slots.entries[index];
        debug_assert!(slot.value.is_none());
        slot.value = Some(value);
        let token = Token::new(slot.generation, index);
        slots.live += 1;
        token
    }

    /**
    Returns the value behind `token` and invalidates the token.

    Exactly one caller can succeed for a given token; every later attempt (and any
    attempt with a token this registry never issued) returns [`Error::InvalidToken`].
    */
    pub fn resolve_and_release(&self, token: Token) -> Result<H, Error> {
        let mut slots = self.slots();
        let slot = slots
            .entries
            .get_mut(token.index())
            .filter(|slot| slot.generation == token.generation())
            .ok_or(Error::InvalidToken(token))?;
        let value = slot.value.take().ok_or(Error::InvalidToken(token))?;
        slot.generation = next_generation(slot.generation);
        slots.free.push(token.index());
        slots.live -= 1;
        Ok(value)
    }

    /**
    Swaps the value behind `token` for `value` and returns the old one.

    The token stays live, so a later [`HandleRegistry::resolve_and_release`] still
    succeeds and sees `value`.
    */
    pub fn replace(&self, token: Token, value: H) -> Result<H, Error> {
        let mut slots = self.slots();
        let current = slots
            .entries
            .get_mut(token.index())
            .filter(|slot| slot.generation == token.generation())
            .and_then(|slot| slot.value.as_mut())
            .ok_or(Error::InvalidToken(token))?;
        Ok(std::mem::replace(current, value))
    }

    /// Number of tokens allocated and not yet released.
    pub fn live(&self) -> usize {
        self.slots().live
    }

    /// Number of live values matching `predicate`.
    pub fn count_live<P>(&self, mut predicate: P) -> usize
    where
        P: FnMut(&H) -> bool,
    {
        self.slots()
            .entries
            .iter()
            .filter_map(|slot| slot.value.as_ref())
            .filter(|value| predicate(value))
            .count()
    }
}

fn next_generation(generation: usize) -> usize {
    let next = (generation + 1) & HALF_MASK;
    if next == 0 { 1 } else { next }
}

impl<H> Default for HandleRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> Debug for HandleRegistry<H> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleRegistry")
            .field("live", &self.live())
            .finish()
    }
}

/**
Terminates the process after a native/managed protocol violation.

Native completions run on foreign threads with no caller to report to, and unwinding
across an `extern "C"` frame is not an option.
*/
pub(crate) fn fatal(error: &Error) -> ! {
    logwise::error_sync!(
        "Fatal readback protocol violation: {err}",
        err = logwise::privacy::LogIt(error)
    );
    std::process::abort()
}
