use std::sync::Arc;

use clap::Parser;
use parking_lot::Mutex;

use muon::{Callable, Context, Event, NativeArch, ObjRef, Runner, Stacklet, UNIT, Value, Vm};

#[derive(Parser, Debug)]
#[command(author, version, about = "cooperative bytecode runtime demo", long_about = None)]
struct Cli {
    /// Arena size in KiB
    #[arg(long, default_value_t = 64)]
    arena_kb: u32,

    /// Number of worker stacklets
    #[arg(long, default_value_t = 4)]
    tasks: u32,

    /// Work items per stacklet
    #[arg(long, default_value_t = 1000)]
    rounds: u32,

    /// Dump allocator statistics at exit
    #[arg(long)]
    stats: bool,
}

/// Sums its round numbers through the context stack, yielding every step.
struct Worker {
    id: u32,
    left: u32,
    total: i64,
    done: ObjRef,
    remaining: Arc<Mutex<u32>>,
}

impl Runner for Worker {
    fn step(&mut self, vm: &mut Vm, me: ObjRef) -> bool {
        if self.left == 0 {
            log::info!("worker {} total {}", self.id, self.total);
            let mut remaining = self.remaining.lock();
            *remaining -= 1;
            if *remaining == 0 {
                drop(remaining);
                vm.notify(self.done);
            }
            return false;
        }
        self.left -= 1;
        let ctx = vm.heap.get::<Stacklet>(me).unwrap().ctx.as_obj().unwrap();
        if !Context::push(&mut vm.heap, ctx, Value::int(self.left as i32)) {
            log::error!("worker {}: arena full", self.id);
            return false;
        }
        self.total += Context::pop(&mut vm.heap, ctx).as_int() as i64;
        vm.sched.line().raise(0); // yield
        true
    }
}

struct Collector {
    done: ObjRef,
    parked: bool,
}

impl Runner for Collector {
    fn step(&mut self, vm: &mut Vm, _me: ObjRef) -> bool {
        if !self.parked {
            self.parked = true;
            if !vm.heap.get::<Event>(self.done).unwrap().is_set() {
                vm.wait_on(self.done);
                return true;
            }
        }
        log::info!("all workers finished");
        false
    }
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let arch = NativeArch::new();
    let mut vm = Vm::new(cli.arena_kb * 1024 / UNIT, arch.line());

    let cb = vm.heap.alloc(Callable::new(4, 1));
    let done = vm.heap.alloc(Event::new());
    vm.pin(Value::obj(done));

    let remaining = Arc::new(Mutex::new(cli.tasks));
    vm.spawn(cb, Box::new(Collector { done, parked: false }));
    for id in 0..cli.tasks {
        vm.spawn(
            cb,
            Box::new(Worker {
                id,
                left: cli.rounds,
                total: 0,
                done,
                remaining: remaining.clone(),
            }),
        );
    }

    while vm.run_loop() {
        arch.idle();
    }

    if cli.stats {
        vm.heap.report();
    }
}
