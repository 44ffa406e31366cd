use statesim::{
    error::SimError,
    gpu::{
        STATE_FORMAT, WgpuContext,
        kernel::{GpuKernel, KernelSources, QUAD_VERTEX_SOURCE},
    },
    sim::{
        BufferPair, StateFrame,
        kernel::{Bindings, Kernel, KernelTarget, Scalars},
    },
};

fn context() -> Option<WgpuContext> {
    match pollster::block_on(WgpuContext::headless()) {
        Ok(ctx) => Some(ctx),
        Err(e) => {
            eprintln!("skipping: no GPU adapter available ({e})");
            None
        }
    }
}

/// A context whose adapter can render into the state format
fn renderable_context() -> Option<WgpuContext> {
    let ctx = context()?;
    if !ctx.supports_state_images() {
        eprintln!("skipping: adapter cannot render into {STATE_FORMAT:?}");
        return None;
    }
    Some(ctx)
}

#[test]
fn update_with_zero_time_step_round_trips_the_initial_state() {
    let Some(ctx) = renderable_context() else {
        return;
    };
    let mut pair = BufferPair::create(&ctx, 24, 10).unwrap();
    pair.initialize(&ctx).unwrap();
    assert_eq!(
        pair.readback(&ctx, pair.front_slot()).unwrap(),
        StateFrame::initial(24, 10)
    );

    let mut update = GpuKernel::update(&ctx).unwrap();
    let scalars = Scalars {
        time_step: 0.0,
        frame: 0,
    };
    let (state, target) = pair.update_io();
    update
        .invoke(&ctx, KernelTarget::Image(target), &Bindings { state, scalars })
        .unwrap();
    pair.flip();

    assert_eq!(
        pair.readback(&ctx, pair.front_slot()).unwrap(),
        StateFrame::initial(24, 10)
    );
}

#[test]
fn invalid_program_is_a_compile_error() {
    let Some(ctx) = context() else {
        return;
    };
    let sources = KernelSources::new(QUAD_VERTEX_SOURCE, "@fragment fn fs_main( -> {");
    let result = GpuKernel::build(&ctx, "broken", &sources, STATE_FORMAT);
    assert!(matches!(result, Err(SimError::Compile { kernel, .. }) if kernel == "broken"));
}

#[test]
fn headless_context_has_no_surface() {
    let Some(ctx) = context() else {
        return;
    };
    assert!(ctx.surface_format().is_none());
}

#[test]
fn state_images_need_a_renderable_format() {
    let Some(ctx) = context() else {
        return;
    };
    let result = BufferPair::create(&ctx, 24, 10);
    if ctx.supports_state_images() {
        assert!(result.is_ok());
    } else {
        assert!(matches!(
            result,
            Err(SimError::Allocation {
                width: 24,
                height: 10,
                ..
            })
        ));
    }
}
