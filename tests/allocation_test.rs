//! Steady-state frames run without touching the heap.
//!
//! A counting global allocator records allocations per thread; after a
//! warm-up that fills the result cache, saving results and running kernels
//! must not allocate.
//!
//! Run with: `cargo test --test allocation_test`

use isp_aic::kernel::PipelineGraph;
use isp_aic::{
    AicContext, Collaborators, ContextSizing, ResultBundle, TerminalMemory, TuningDefaults,
};
use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::hint::black_box;

struct CountingAllocator;

thread_local! {
    static ALLOCATIONS: Cell<usize> = const { Cell::new(0) };
}

fn count_allocation() {
    let _ = ALLOCATIONS.try_with(|n| n.set(n.get() + 1));
}

#[allow(unsafe_code)]
unsafe impl GlobalAlloc for CountingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        count_allocation();
        System.alloc(layout)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        count_allocation();
        System.alloc_zeroed(layout)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        count_allocation();
        System.realloc(ptr, layout, new_size)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout);
    }
}

#[global_allocator]
static GLOBAL: CountingAllocator = CountingAllocator;

fn allocations_during(f: impl FnOnce()) -> usize {
    let before = ALLOCATIONS.with(Cell::get);
    f();
    ALLOCATIONS.with(Cell::get) - before
}

/// Context with the demo graph configured and every terminal bound.
fn demo_context() -> (AicContext, PipelineGraph) {
    let graph = PipelineGraph::from_toml_str(include_str!("../demos/graph.toml")).unwrap();
    let mut ctx = AicContext::new(
        0,
        ContextSizing::default(),
        &TuningDefaults::default(),
        Collaborators::default(),
    )
    .unwrap();
    for group in &graph.groups {
        let table = ctx.configure(group).unwrap();
        for entry in &table.entries {
            ctx.register_buffer(
                table.group_id,
                entry.terminal_index,
                entry.fragment_index,
                TerminalMemory::zeroed(entry.size),
                entry.size,
            )
            .unwrap();
        }
    }
    (ctx, graph)
}

fn run_frame(ctx: &mut AicContext, graph: &PipelineGraph, frame_id: u64, bundle: &ResultBundle) {
    ctx.save_results(frame_id, bundle);
    for group in &graph.groups {
        for fragment in 0..group.fragment_count {
            black_box(ctx.run_kernels(group.group_id, frame_id, fragment).unwrap());
        }
    }
}

#[test]
fn test_steady_state_frames_do_not_allocate() {
    let (mut ctx, graph) = demo_context();
    let bundle = TuningDefaults::default().cold_start_bundle();
    assert!(bundle.is_complete());

    let warm_up = 2 * ctx.result_cache().capacity() as u64;
    for frame_id in 0..warm_up {
        run_frame(&mut ctx, &graph, frame_id, &bundle);
    }

    let frame_id = warm_up;
    let saved = allocations_during(|| ctx.save_results(frame_id, &bundle));
    assert_eq!(saved, 0, "save_results allocated");

    let ran = allocations_during(|| {
        black_box(ctx.run_kernels(0, frame_id, 0).unwrap());
        black_box(ctx.run_kernels(1, frame_id, 1).unwrap());
    });
    assert_eq!(ran, 0, "run_kernels allocated");

    let resaved = allocations_during(|| ctx.save_results(frame_id, &bundle));
    assert_eq!(resaved, 0, "overwriting a cached frame allocated");
}

#[test]
fn test_held_results_are_copied_not_overwritten() {
    let (mut ctx, graph) = demo_context();
    let bundle = TuningDefaults::default().cold_start_bundle();
    let capacity = ctx.result_cache().capacity() as u64;
    for frame_id in 0..capacity {
        run_frame(&mut ctx, &graph, frame_id, &bundle);
    }

    // The oldest frame is the next eviction victim; holding it forces a copy
    let held = ctx.query_results(0);
    let allocated = allocations_during(|| ctx.save_results(capacity, &bundle));
    assert!(allocated > 0);
    assert_eq!(held, bundle);
}
