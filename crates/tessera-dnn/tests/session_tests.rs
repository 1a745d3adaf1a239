//! End-to-end tests of coherent buffers and device layers on the simulated runtime.
//! Run with: cargo test -p tessera-dnn

use std::sync::Arc;

use tessera_core::{BridgeConfig, HostTensor, Result, Shape, SimDeviceConfig, StreamPolicy};
use tessera_dnn::{
    Coherence, CoherentBuffer, DeviceContext, DeviceLayer, DeviceSession, LayerKind, LayerParams, LayerRegistry,
    ScratchBudget, Workspace,
};
use tessera_kernels::{status, DeviceTensorSpan, DeviceTensorView, SharedRuntime, SimRuntime};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn session_with(config: BridgeConfig) -> (Arc<SimRuntime>, DeviceSession) {
    init_tracing();
    let sim = Arc::new(SimRuntime::new(config.sim.clone()));
    let rt: SharedRuntime = sim.clone();
    let session = DeviceSession::with_runtime(config, rt).unwrap();
    (sim, session)
}

fn session() -> (Arc<SimRuntime>, DeviceSession) {
    session_with(BridgeConfig::default())
}

fn wrap(session: &DeviceSession, values: &[f32], dims: &[usize]) -> CoherentBuffer {
    session.wrap_host(HostTensor::from_f32(values, dims).unwrap()).unwrap()
}

fn read_back(buf: &CoherentBuffer) -> Vec<f32> {
    buf.sync_to_host().unwrap();
    buf.host().unwrap().to_vec()
}

// ============================================================================
// Coherence
// ============================================================================

#[test]
fn test_const_layer_round_trip() {
    let (_sim, mut session) = session();
    let blob = HostTensor::from_f32(&[1.0, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
    let mut layer = session
        .create_layer(&LayerParams::new("c", LayerKind::Const).with_blob(blob))
        .unwrap();

    let out = session.wrap_host(HostTensor::zeros(&[2, 2])).unwrap();
    session.forward(layer.as_mut(), &[], &mut [out.clone()]).unwrap();
    assert_eq!(out.coherence().unwrap(), Coherence::DeviceAhead);

    assert_eq!(read_back(&out), vec![1.0, 2.0, 3.0, 4.0]);
    assert_eq!(out.coherence().unwrap(), Coherence::Clean);
}

#[test]
fn test_never_both_sides_dirty() {
    let (_sim, mut session) = session();
    let mut layer = session
        .create_layer(&LayerParams::new("s", LayerKind::Scale).with_value("alpha", 2.0))
        .unwrap();
    let buf = wrap(&session, &[1.0, 2.0, 3.0], &[3]);

    let check = |buf: &CoherentBuffer| {
        let state = buf.coherence().unwrap();
        assert!(!(state.host_dirty() && state.device_dirty()));
    };

    check(&buf);
    buf.sync_to_device().unwrap();
    check(&buf);
    session.forward(layer.as_mut(), &[buf.clone()], &mut [buf.clone()]).unwrap();
    check(&buf);
    buf.mark_host_dirty().unwrap();
    assert_eq!(buf.coherence().unwrap(), Coherence::HostAhead);
    check(&buf);
}

#[test]
fn test_syncs_are_idempotent() {
    let (sim, session) = session();
    let buf = wrap(&session, &[1.0, 2.0, 3.0, 4.0], &[4]);

    buf.device_view().unwrap();
    buf.device_view().unwrap();
    buf.sync_to_device().unwrap();
    assert_eq!(sim.stats().htod_copies, 1);

    buf.sync_to_host().unwrap();
    assert_eq!(sim.stats().dtoh_copies, 0);
}

#[test]
fn test_host_edit_flows_back_to_device() {
    let (sim, mut session) = session();
    let mut layer = session
        .create_layer(&LayerParams::new("s", LayerKind::Scale).with_value("alpha", 10.0))
        .unwrap();
    let x = wrap(&session, &[1.0, 2.0], &[2]);
    let y = session.wrap_host(HostTensor::zeros(&[2])).unwrap();

    session.forward(layer.as_mut(), &[x.clone()], &mut [y.clone()]).unwrap();
    assert_eq!(read_back(&y), vec![10.0, 20.0]);

    x.host().unwrap().copy_from_slice(&[-1.0, 5.0]).unwrap();
    x.mark_host_dirty().unwrap();
    session.forward(layer.as_mut(), &[x.clone()], &mut [y.clone()]).unwrap();
    assert_eq!(read_back(&y), vec![-10.0, 50.0]);
    assert_eq!(sim.stats().htod_copies, 2);
}

#[test]
fn test_aliases_share_state() {
    let (sim, session) = session();
    let base = wrap(&session, &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0], &[2, 3]);
    let flat = base.derive([6]).unwrap();
    assert!(flat.same_block(&base));
    assert_eq!(base.alias_count(), 2);

    flat.device_view().unwrap();
    assert_eq!(base.coherence().unwrap(), Coherence::Clean);

    base.mark_device_dirty().unwrap();
    assert!(flat.device_dirty().unwrap());

    drop(base);
    assert_eq!(sim.live_allocations(), 1);
    drop(flat);
    assert_eq!(sim.live_allocations(), 0);
    assert_eq!(sim.pinned_ranges(), 0);
    assert_eq!(session.arena().live_blocks(), 0);
}

#[test]
fn test_invalid_subspan_leaves_parent_intact() {
    let (_sim, session) = session();
    let base = wrap(&session, &[1.0; 6], &[2, 3]);
    let view = base.device_view().unwrap();

    assert!(view.subspan(&[0, 2], &[2, 4]).unwrap_err().is_invalid_argument());
    assert!(view.subspan(&[1], &[0]).unwrap_err().is_invalid_argument());
    assert!(base.derive([7]).unwrap_err().is_invalid_argument());

    assert_eq!(view.shape(), &Shape::new(&[2, 3]));
    assert_eq!(base.shape(), &Shape::new(&[2, 3]));
    assert_eq!(base.alias_count(), 1);

    let row = view.subspan(&[1, 0], &[2, 3]).unwrap();
    assert_eq!(row.numel(), 3);
    assert_eq!(row.offset(), 3);
}

// ============================================================================
// Layers
// ============================================================================

#[test]
fn test_layers_share_the_session_stream() {
    let (sim, mut session) = session();
    let blas_stream = session.handles().blas.stream().cloned();
    let dnn_stream = session.handles().dnn.stream().cloned();
    assert_eq!(blas_stream.as_ref(), Some(session.stream()));
    assert_eq!(dnn_stream.as_ref(), Some(session.stream()));

    let mut relu = session.create_layer(&LayerParams::new("r", LayerKind::Relu)).unwrap();
    let mut scale = session
        .create_layer(&LayerParams::new("s", LayerKind::Scale).with_value("alpha", 3.0))
        .unwrap();

    let x = wrap(&session, &[-1.0, 2.0, -3.0, 4.0], &[4]);
    let y = session.wrap_host(HostTensor::zeros(&[4])).unwrap();
    session.forward(relu.as_mut(), &[x], &mut [y.clone()]).unwrap();
    session.forward(scale.as_mut(), &[y.clone()], &mut [y.clone()]).unwrap();

    assert_eq!(read_back(&y), vec![0.0, 6.0, 0.0, 12.0]);
    assert_eq!(sim.stats().library_calls, 2);
    assert_eq!(sim.live_handles(), 2);
}

#[test]
fn test_dropping_one_layer_keeps_shared_handle() {
    let (sim, mut session) = session();
    let first = session.create_layer(&LayerParams::new("r1", LayerKind::Relu)).unwrap();
    let mut second = session.create_layer(&LayerParams::new("r2", LayerKind::Relu)).unwrap();
    assert_eq!(session.handles().dnn.use_count(), 3);

    drop(first);
    assert_eq!(session.handles().dnn.use_count(), 2);
    assert_eq!(sim.live_handles(), 2);

    let x = wrap(&session, &[-5.0, 5.0], &[2]);
    let y = session.wrap_host(HostTensor::zeros(&[2])).unwrap();
    session.forward(second.as_mut(), &[x], &mut [y.clone()]).unwrap();
    assert_eq!(read_back(&y), vec![0.0, 5.0]);
}

#[test]
fn test_scale_kernel_covers_every_element() {
    let config = BridgeConfig {
        sim: SimDeviceConfig {
            multiprocessors: 1,
            max_threads_per_block: 256,
            max_threads_per_multiprocessor: 256,
            ..SimDeviceConfig::default()
        },
        ..BridgeConfig::default()
    };
    let (sim, mut session) = session_with(config);
    let mut layer = session
        .create_layer(
            &LayerParams::new("s", LayerKind::Scale)
                .with_value("alpha", 2.0)
                .with_value("beta", 1.0),
        )
        .unwrap();

    let n = 5000;
    let values: Vec<f32> = (0..n).map(|i| i as f32).collect();
    let x = wrap(&session, &values, &[n]);
    let y = session.wrap_host(HostTensor::zeros(&[n])).unwrap();
    session.forward(layer.as_mut(), &[x], &mut [y.clone()]).unwrap();

    let expected: Vec<f32> = values.iter().map(|v| 2.0 * v + 1.0).collect();
    assert_eq!(read_back(&y), expected);
    assert_eq!(sim.stats().launches, 1);
    assert_eq!(sim.stats().library_calls, 0);
}

#[test]
fn test_scale_without_shift_uses_blas() {
    let (sim, mut session) = session();
    let mut layer = session
        .create_layer(&LayerParams::new("s", LayerKind::Scale).with_value("alpha", -0.5))
        .unwrap();
    let x = wrap(&session, &[2.0, 4.0], &[2]);
    let y = session.wrap_host(HostTensor::zeros(&[2])).unwrap();
    session.forward(layer.as_mut(), &[x], &mut [y.clone()]).unwrap();

    assert_eq!(read_back(&y), vec![-1.0, -2.0]);
    assert_eq!(sim.stats().launches, 0);
    assert_eq!(sim.stats().dtod_copies, 1);
    assert_eq!(sim.stats().library_calls, 1);
}

#[test]
fn test_wrong_output_count_rejected() {
    let (_sim, mut session) = session();
    let mut layer = session.create_layer(&LayerParams::new("r", LayerKind::Relu)).unwrap();
    let x = wrap(&session, &[1.0, 2.0], &[2]);
    let err = session.forward(layer.as_mut(), &[x.clone()], &mut []).unwrap_err();
    assert!(err.is_invalid_argument());

    let small = wrap(&session, &[0.0], &[1]);
    let err = session.forward(layer.as_mut(), &[x], &mut [small.clone()]).unwrap_err();
    assert!(err.is_invalid_argument());
    assert_eq!(small.coherence().unwrap(), Coherence::HostAhead);
}

#[test]
fn test_registry_controls_device_path() {
    let (_sim, session) = session();
    assert!(session.supports_device_execution(LayerKind::Relu));

    let mut registry = LayerRegistry::new();
    registry.register(LayerKind::Scale, |p| {
        Ok(Box::new(tessera_dnn::layers::ScaleLayer::from_params(p)?))
    });
    let mut session = session.with_registry(registry);
    assert!(!session.supports_device_execution(LayerKind::Relu));
    assert!(session.supports_device_execution(LayerKind::Scale));
    let err = session
        .create_layer(&LayerParams::new("r", LayerKind::Relu))
        .err()
        .unwrap();
    assert!(err.is_invalid_argument());
}

// ============================================================================
// Errors
// ============================================================================

#[test]
fn test_library_failure_carries_status() {
    let (sim, mut session) = session();
    let mut layer = session.create_layer(&LayerParams::new("r", LayerKind::Relu)).unwrap();
    let x = wrap(&session, &[1.0], &[1]);
    let y = session.wrap_host(HostTensor::zeros(&[1])).unwrap();

    sim.fail_next_library_call(status::EXECUTION_FAILED);
    let err = session.forward(layer.as_mut(), &[x.clone()], &mut [y.clone()]).unwrap_err();
    assert!(err.is_device_error());
    assert_eq!(err.status(), Some(status::EXECUTION_FAILED));

    session.forward(layer.as_mut(), &[x], &mut [y.clone()]).unwrap();
    assert_eq!(read_back(&y), vec![1.0]);
}

#[test]
fn test_fault_during_sync_to_host_keeps_device_ahead() {
    let (sim, mut session) = session();
    let mut layer = session.create_layer(&LayerParams::new("r", LayerKind::Relu)).unwrap();
    let x = wrap(&session, &[-1.0, 1.0], &[2]);
    let y = session.wrap_host(HostTensor::zeros(&[2])).unwrap();
    session.forward(layer.as_mut(), &[x], &mut [y.clone()]).unwrap();
    session.synchronize().unwrap();

    sim.fault_next_operation(status::ILLEGAL_ADDRESS);
    let err = y.sync_to_host().unwrap_err();
    assert_eq!(err.status(), Some(status::ILLEGAL_ADDRESS));
    assert_eq!(y.coherence().unwrap(), Coherence::DeviceAhead);
    assert_eq!(y.host().unwrap().to_vec(), vec![0.0, 0.0]);
}

#[test]
fn test_unprepared_layer_rejected() {
    let (_sim, mut session) = session();
    let mut layer = tessera_dnn::layers::ReluLayer::new();
    let x = wrap(&session, &[1.0], &[1]);
    let y = wrap(&session, &[0.0], &[1]);
    let err = session.forward(&mut layer, &[x], &mut [y]).unwrap_err();
    assert!(err.is_invalid_argument());
}

// ============================================================================
// Sessions and scratch
// ============================================================================

/// Copies its input through the workspace.
struct StagingLayer {
    context: Option<DeviceContext>,
    staged_floats: usize,
}

impl DeviceLayer for StagingLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Scale
    }

    fn output_shapes(&self, inputs: &[Shape]) -> Result<Vec<Shape>> {
        Ok(inputs.to_vec())
    }

    fn prepare_for_device(&mut self, context: &DeviceContext, scratch: &mut ScratchBudget) -> Result<()> {
        scratch.require(self.staged_floats * std::mem::size_of::<f32>())?;
        self.context = Some(context.clone());
        Ok(())
    }

    fn execute_on_device(
        &mut self,
        inputs: &[DeviceTensorView],
        outputs: &[DeviceTensorSpan],
        workspace: &mut Workspace,
    ) -> Result<()> {
        let stream = &self.context.as_ref().unwrap().stream;
        let staging = workspace.span_f32(inputs[0].numel())?;
        tessera_kernels::ops::copy_dtod(stream, &staging, &inputs[0])?;
        tessera_kernels::ops::copy_dtod(stream, &outputs[0], staging.as_view())
    }
}

/// Claims no device implementation.
struct HostOnlyLayer;

impl DeviceLayer for HostOnlyLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Relu
    }

    fn supports_device_execution(&self) -> bool {
        false
    }

    fn output_shapes(&self, inputs: &[Shape]) -> Result<Vec<Shape>> {
        Ok(inputs.to_vec())
    }

    fn prepare_for_device(&mut self, _context: &DeviceContext, _scratch: &mut ScratchBudget) -> Result<()> {
        Ok(())
    }

    fn execute_on_device(
        &mut self,
        _inputs: &[DeviceTensorView],
        _outputs: &[DeviceTensorSpan],
        _workspace: &mut Workspace,
    ) -> Result<()> {
        unreachable!("host-only layer executed on the device")
    }
}

#[test]
fn test_workspace_grows_to_layer_needs() {
    let (_sim, mut session) = session();
    let mut layer = StagingLayer {
        context: None,
        staged_floats: 3,
    };
    session.prepare(&mut layer).unwrap();
    assert_eq!(session.workspace_bytes(), 12);

    let x = wrap(&session, &[7.0, 8.0, 9.0], &[3]);
    let y = session.wrap_host(HostTensor::zeros(&[3])).unwrap();
    session.forward(&mut layer, &[x], &mut [y.clone()]).unwrap();
    assert_eq!(read_back(&y), vec![7.0, 8.0, 9.0]);
}

#[test]
fn test_scratch_over_budget_fails() {
    let config = BridgeConfig {
        max_scratch_bytes: 16,
        ..BridgeConfig::default()
    };
    let (sim, mut session) = session_with(config);
    let mut layer = StagingLayer {
        context: None,
        staged_floats: 5,
    };
    let err = session.prepare(&mut layer).unwrap_err();
    assert!(err.is_resource_creation());
    assert_eq!(session.workspace_bytes(), 0);
    assert_eq!(sim.live_allocations(), 0);
}

#[test]
fn test_host_only_layer_rejected() {
    let (_sim, mut session) = session();
    let x = wrap(&session, &[1.0], &[1]);
    let y = wrap(&session, &[0.0], &[1]);
    let err = session.forward(&mut HostOnlyLayer, &[x], &mut [y.clone()]).unwrap_err();
    assert!(err.is_invalid_argument());
    assert_eq!(y.coherence().unwrap(), Coherence::HostAhead);
}

#[test]
fn test_dedicated_stream_session() {
    let config = BridgeConfig::from_json(r#"{ "stream": "dedicated" }"#).unwrap();
    let (sim, session) = session_with(config);
    assert!(!session.stream().is_default());
    assert_eq!(sim.live_streams(), 1);
    assert_eq!(sim.live_handles(), 2);

    let buf = wrap(&session, &[1.0], &[1]);
    assert_eq!(buf.stream().unwrap(), *session.stream());

    drop(session);
    assert_eq!(sim.live_streams(), 1);
    drop(buf);
    assert_eq!(sim.live_streams(), 0);
    assert_eq!(sim.live_handles(), 0);
}

#[test]
fn test_session_from_config_opens_sim() {
    init_tracing();
    let session = DeviceSession::new(BridgeConfig::default()).unwrap();
    assert_eq!(session.runtime().name(), "sim");
    assert!(session.stream().is_default());
    assert_eq!(session.config().stream, StreamPolicy::Default);
}
