//! Connection setup and the solver run

use anyhow::{Context, Result};
use newsensors_core::interface::{ANY_IDENTIFIER_PATTERN, SENSOR_ATTRIBUTE_PATTERN};
use newsensors_core::{ControlLoop, ReconciliationEngine, Shutdown};
use newsensors_grail::{AggregatorConnection, ClientConnection, SolverConnection, SubscriptionRule};
use std::time::Instant;
use tracing::{info, info_span};

use crate::config::Config;

/// Connect to the aggregator and both world model ports, then run the
/// reconciliation loop until `shutdown` is triggered or a fatal error occurs.
pub async fn run(config: &Config, shutdown: Shutdown) -> Result<()> {
    let connect_timeout = config.connect_timeout();

    let rule = SubscriptionRule::all(
        config.aggregator.physical_layer,
        config.aggregator.update_interval_ms,
    );
    let telemetry = AggregatorConnection::connect(
        &config.aggregator.host,
        config.aggregator.port,
        connect_timeout,
        vec![rule],
    )
    .await
    .context("Unable to connect to the aggregator")?;

    let mut writer = SolverConnection::connect(
        &config.world_model.host,
        config.world_model.solver_port,
        connect_timeout,
        config.world_model.origin.clone(),
    )
    .await
    .context("Unable to connect to the world model as a solver")?;

    let mut registry = ClientConnection::connect(
        &config.world_model.host,
        config.world_model.client_port,
        connect_timeout,
    )
    .await
    .context("Unable to connect to the world model as a client")?;

    let namespace = config.namespace();
    let engine = ReconciliationEngine::new(
        namespace.clone(),
        info_span!("solver", origin = %config.world_model.origin),
    );
    engine
        .declare_attributes(&mut writer)
        .context("Unable to announce placeholder attributes")?;
    registry
        .stream(
            ANY_IDENTIFIER_PATTERN,
            &[SENSOR_ATTRIBUTE_PATTERN],
            config.update_interval(),
        )
        .context("Unable to request the sensor attribute stream")?;

    info!(namespace = %namespace, "Solver ready");

    let control = ControlLoop::new(
        engine,
        telemetry,
        registry,
        writer,
        config.to_loop_config(),
        shutdown,
        Instant::now(),
    );
    control.run().await?;
    Ok(())
}
