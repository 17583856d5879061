use std::mem::MaybeUninit;
use std::ptr;

/// Upper bound on the argument payload a task can be spawned with.
pub const MAX_TASK_ARGS_SIZE: usize = 128;

/// The callable slot fits a function pointer or a closure capturing at most
/// two machine words. Sized for 64-bit targets; the `const` assertions below
/// enforce the two-word limit on every target.
const CALLABLE_SIZE: usize = 16;

const MAX_ALIGN: usize = 16;

#[repr(C, align(16))]
struct CallableBuf([MaybeUninit<u8>; CALLABLE_SIZE]);

#[repr(C, align(16))]
struct ArgsBuf([MaybeUninit<u8>; MAX_TASK_ARGS_SIZE]);

/// Descriptor of the next invocation to run on a fiber.
///
/// The callable and its arguments are stored inline as plain bytes and
/// reinterpreted by a monomorphized shim, so spawning a task performs no
/// heap allocation. The payload is moved out exactly once by [`invoke`];
/// a descriptor that is dropped without being invoked leaks its payload
/// (its destructor never runs), which only happens if the runtime is torn
/// down with the task never started.
///
/// [`invoke`]: TaskFuncInfo::invoke
pub(crate) struct TaskFuncInfo {
    invoke: unsafe fn(*mut TaskFuncInfo),
    callable: CallableBuf,
    args: ArgsBuf,
}

impl TaskFuncInfo {
    /// Packs a small closure. Closures carrying more than two machine words
    /// of captured state are rejected at compile time; route bigger payloads
    /// through [`from_fn_args`].
    ///
    /// [`from_fn_args`]: TaskFuncInfo::from_fn_args
    pub(crate) fn from_closure<F>(f: F) -> Self
    where
        F: FnOnce() + 'static,
    {
        const {
            assert!(
                size_of::<F>() <= 2 * size_of::<usize>(),
                "task closure captures more than two machine words; \
                 pass large state as arguments via run_task_with"
            );
            assert!(align_of::<F>() <= MAX_ALIGN);
        }

        let mut info = Self::empty(invoke_closure::<F>);
        // Safety: the assertions above guarantee the buffer fits F, and the
        // buffer alignment covers F's.
        unsafe { ptr::write(info.callable.0.as_mut_ptr().cast::<F>(), f) };
        info
    }

    /// Packs a function pointer plus an argument payload of at most
    /// [`MAX_TASK_ARGS_SIZE`] bytes. Oversized payloads are rejected at
    /// compile time.
    pub(crate) fn from_fn_args<A>(func: fn(A), args: A) -> Self
    where
        A: 'static,
    {
        const {
            assert!(
                size_of::<A>() <= MAX_TASK_ARGS_SIZE,
                "task argument payload exceeds the inline spawn limit"
            );
            assert!(align_of::<A>() <= MAX_ALIGN);
        }

        let mut info = Self::empty(invoke_fn_args::<A>);
        // Safety: fn pointers are one word; A fits per the assertions above.
        unsafe {
            ptr::write(info.callable.0.as_mut_ptr().cast::<fn(A)>(), func);
            ptr::write(info.args.0.as_mut_ptr().cast::<A>(), args);
        }
        info
    }

    /// Moves the payload out and runs it.
    pub(crate) fn invoke(mut self) {
        let invoke = self.invoke;
        // Safety: constructors wrote a payload matching the shim's types,
        // and consuming `self` makes this the only read.
        unsafe { invoke(&raw mut self) };
    }

    fn empty(invoke: unsafe fn(*mut TaskFuncInfo)) -> Self {
        Self {
            invoke,
            callable: CallableBuf([MaybeUninit::uninit(); CALLABLE_SIZE]),
            args: ArgsBuf([MaybeUninit::uninit(); MAX_TASK_ARGS_SIZE]),
        }
    }
}

unsafe fn invoke_closure<F: FnOnce()>(info: *mut TaskFuncInfo) {
    // Safety: written by `from_closure::<F>` and read exactly once.
    let f = unsafe { ptr::read((*info).callable.0.as_ptr().cast::<F>()) };
    f();
}

unsafe fn invoke_fn_args<A>(info: *mut TaskFuncInfo) {
    // Safety: written by `from_fn_args::<A>` and read exactly once.
    let (func, args) = unsafe {
        (
            ptr::read((*info).callable.0.as_ptr().cast::<fn(A)>()),
            ptr::read((*info).args.0.as_ptr().cast::<A>()),
        )
    };
    func(args);
}
