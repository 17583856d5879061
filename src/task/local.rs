//! Fiber-local storage.
//!
//! Every registered [`TaskLocal`] gets a process-wide stable byte offset into
//! each fiber's storage area. Storage is allocated lazily per fiber, values
//! are constructed lazily on first access per task, and values with
//! destructors are dropped when the task ends. The storage bytes themselves
//! are retained across task instances because fibers are reused.

use crate::task::fiber::{self, TaskFiber};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::marker::PhantomData;
use std::ptr;
use std::sync::OnceLock;

/// Slot offsets are padded to this alignment; payload types must not require
/// more.
const SLOT_ALIGN: usize = 8;

/// Extra bytes reserved whenever a fiber grows its storage, so bumping one
/// slot usually covers the next few registrations too.
const STORAGE_SLACK: usize = 128;

/// Extra bits reserved whenever a fiber grows its initialized set.
const BITSET_SLACK: usize = 64;

#[derive(Clone, Copy)]
struct SlotInfo {
    offset: usize,
    drop: Option<unsafe fn(*mut u8)>,
}

/// Process-global slot registry. Offsets are permanent once assigned, so
/// fibers on every thread agree on the layout.
struct Registry {
    /// Bytes reserved so far, always a multiple of [`SLOT_ALIGN`].
    fill: usize,
    slots: Vec<SlotInfo>,
}

static REGISTRY: Mutex<Registry> = Mutex::new(Registry {
    fill: 0,
    slots: Vec::new(),
});

#[derive(Clone, Copy, Debug)]
pub(crate) struct FlsSlot {
    id: usize,
    offset: usize,
}

#[track_caller]
fn register<T>() -> FlsSlot {
    assert!(
        align_of::<T>() <= SLOT_ALIGN,
        "fiber-local values must have an alignment of at most 8 bytes"
    );

    let mut registry = REGISTRY.lock();
    let offset = registry.fill;
    let id = registry.slots.len();
    registry.fill += size_of::<T>().next_multiple_of(SLOT_ALIGN);
    registry.slots.push(SlotInfo {
        offset,
        drop: if std::mem::needs_drop::<T>() {
            Some(drop_slot::<T>)
        } else {
            None
        },
    });
    FlsSlot { id, offset }
}

unsafe fn drop_slot<T>(ptr: *mut u8) {
    // Safety: called only for slots whose initialized bit is set, with the
    // address the value was constructed at.
    unsafe { ptr.cast::<T>().drop_in_place() }
}

/// Per-fiber storage area. Backed by `u64` words so the base address is
/// always 8-byte aligned, matching [`SLOT_ALIGN`].
#[derive(Debug, Default)]
pub(crate) struct FlsStorage {
    words: Vec<u64>,
}

impl FlsStorage {
    pub(crate) const fn new() -> Self {
        Self { words: Vec::new() }
    }

    fn len_bytes(&self) -> usize {
        self.words.len() * size_of::<u64>()
    }

    fn grow_to_bytes(&mut self, bytes: usize) {
        let words = bytes.div_ceil(size_of::<u64>());
        if words > self.words.len() {
            self.words.resize(words, 0);
        }
    }

    fn base_ptr(&mut self) -> *mut u8 {
        self.words.as_mut_ptr().cast()
    }
}

/// A task-local value, the fiber analogue of [`std::thread_local!`].
///
/// Declare one as a `static`; each task observes its own lazily-initialized
/// copy, and copies with destructors are dropped when their task ends.
/// Mutation goes through interior-mutability payloads (`Cell`, `RefCell`),
/// exactly like thread locals:
///
/// ```
/// use fibra::TaskLocal;
/// use std::cell::Cell;
///
/// static COUNTER: TaskLocal<Cell<u32>> = TaskLocal::new();
///
/// COUNTER.with(|c| c.set(c.get() + 1));
/// ```
///
/// Outside of any task the value lives on a per-thread dummy fiber, so access
/// never fails; such values are only dropped when the process exits.
pub struct TaskLocal<T: 'static> {
    slot: OnceLock<FlsSlot>,
    init: fn() -> T,
    // fn() -> T keeps `TaskLocal` Send/Sync regardless of T: the handle never
    // stores a value, fibers do.
    _marker: PhantomData<fn() -> T>,
}

impl<T: Default + 'static> TaskLocal<T> {
    /// A task local initialized with `T::default()` on first access.
    pub const fn new() -> Self {
        Self::with_init(T::default)
    }
}

impl<T: Default + 'static> Default for TaskLocal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> TaskLocal<T> {
    /// A task local initialized by `init` on first access.
    pub const fn with_init(init: fn() -> T) -> Self {
        Self {
            slot: OnceLock::new(),
            init,
            _marker: PhantomData,
        }
    }

    /// Runs `f` with this task's copy of the value, initializing it first if
    /// this is the task's first access.
    ///
    /// Initializers may touch other task locals; `f` may too, as long as
    /// those locals have already been initialized on this fiber.
    ///
    /// # Panics
    ///
    /// Panics at first use if `T` requires an alignment above 8 bytes, or if
    /// an access nested inside `f` forces a storage reallocation while this
    /// borrow is live (initialize locals before nesting accesses).
    #[track_caller]
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let slot = *self.slot.get_or_init(register::<T>);
        let fiber_ptr = fiber::current_or_dummy();
        // Safety: fibers are never freed and FLS is only touched from the
        // fiber's owning thread.
        let fiber = unsafe { fiber_ptr.as_ref() };

        // Out-of-range bits read as unset, so this needs no growth.
        let initialized = unsafe { &*fiber.fls_initialized.get() }.get(slot.id);

        // Run the initializer before resolving the slot address: it is user
        // code and may touch other locals, growing this fiber's storage and
        // moving the backing allocation out from under any pointer resolved
        // earlier.
        let initial = if initialized {
            None
        } else {
            Some((self.init)())
        };

        let value = unsafe { Self::slot_ptr(fiber, slot) };

        if let Some(initial) = initial
            // The initializer may have accessed this very local; keep the
            // value that nested access constructed instead of clobbering it.
            && !unsafe { &*fiber.fls_initialized.get() }.get(slot.id)
        {
            // Safety: bit is unset, so no reference to the slot exists yet.
            unsafe {
                (*fiber.fls_initialized.get()).set(slot.id);
                ptr::write(value, initial);
            }
        }

        let depth = fiber.fls_borrows.get();
        fiber.fls_borrows.set(depth + 1);
        // Restore the borrow depth even if `f` unwinds: the fiber boundary
        // catches task panics and the fiber is reused afterwards.
        let _restore = crate::utils::ScopeGuard::new(|| fiber.fls_borrows.set(depth));
        f(unsafe { &*value })
    }

    /// Resolves the slot address on `fiber`, growing the storage and the
    /// initialized set if the slot is new to this fiber.
    unsafe fn slot_ptr(fiber: &TaskFiber, slot: FlsSlot) -> *mut T {
        let storage = fiber.fls_storage.get();
        let bits = fiber.fls_initialized.get();

        let needs_storage = unsafe { &*storage }.len_bytes() < slot.offset + size_of::<T>();
        let needs_bits = unsafe { &*bits }.capacity() <= slot.id;
        if needs_storage || needs_bits {
            assert_eq!(
                fiber.fls_borrows.get(),
                0,
                "cannot grow fiber-local storage while a task-local borrow is live"
            );
            let (fill, count) = {
                let registry = REGISTRY.lock();
                (registry.fill, registry.slots.len())
            };
            // Safety: no outstanding borrows per the assert above, so
            // reallocating the backing storage invalidates nothing.
            unsafe {
                (*storage).grow_to_bytes(fill + STORAGE_SLACK);
                (*bits).grow_to(count + BITSET_SLACK);
            }
        }

        unsafe { (*storage).base_ptr().add(slot.offset).cast::<T>() }
    }
}

/// Drops every initialized slot on `fiber` and clears the initialized set.
/// Called when a task ends; the storage bytes are kept for the next task.
///
/// # Safety
///
/// Must run on the fiber's owning thread with no task-local borrows live.
pub(crate) unsafe fn destroy(fiber: &TaskFiber) {
    debug_assert_eq!(fiber.fls_borrows.get(), 0);

    let initialized: SmallVec<[usize; 16]> =
        unsafe { &*fiber.fls_initialized.get() }.ones().collect();
    if initialized.is_empty() {
        return;
    }

    // Snapshot the slot table outside the lock: a destructor is user code and
    // may register new locals.
    let slots: SmallVec<[SlotInfo; 16]> = {
        let registry = REGISTRY.lock();
        initialized.iter().map(|&id| registry.slots[id]).collect()
    };

    let base = unsafe { (*fiber.fls_storage.get()).base_ptr() };
    for info in &slots {
        if let Some(drop) = info.drop {
            // Safety: the bit was set, so the slot holds a live value.
            unsafe { drop(base.add(info.offset)) };
        }
    }
    unsafe { (*fiber.fls_initialized.get()).clear_all() };
}
