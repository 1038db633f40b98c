mod arch;
mod context;
mod heap;
mod object;
mod scheduler;
mod tagged;
mod vector;
mod vm;

pub use arch::{InterruptLine, MAX_LINES, NativeArch};
pub use context::{Context, EXC_STEP, FINALLY, FRAME_HDR};
pub use heap::{GcStats, Heap, OomHook};
pub use object::{Array, Callable, HeapObj, ObjRef, Tracer};
pub use scheduler::{Event, Scheduler};
pub use tagged::{Tag, Value};
pub use vector::{HDR, UNIT, ValueVec, VecId, VecRegion};
pub use vm::{Runner, Stacklet, StackletState, Vm};
