use anyhow::Context;
use clap::Parser;
use sharded_table::assignment::protocol::ControlSignal;
use sharded_table::assignment::types::NodeStage;
use sharded_table::assignment::{ShardAssigner, register_with_coordinator, report_end};
use sharded_table::cluster::directory::ClusterDirectory;
use sharded_table::cluster::types::{NodeId, NodeInfo, NodeRole};
use sharded_table::config::NodeArgs;
use sharded_table::server::{TableServer, router};
use sharded_table::table::descriptor::{ElementwiseSum, ModSharder, TableDescriptor};
use sharded_table::table::typed::TypedTable;
use sharded_table::transport::Transport;
use sharded_table::transport::http::HttpTransport;
use std::sync::Arc;
use std::time::{Duration, Instant};

const PARAMS_TABLE: u32 = 0;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = NodeArgs::parse();

    tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .init();

    args.validate()?;

    let local_id = match args.role {
        NodeRole::Coordinator => NodeId::coordinator(),
        _ => NodeId::new(),
    };
    let local_node = NodeInfo {
        id: local_id,
        addr: args.bind,
        role: args.role,
    };
    tracing::info!("Starting {:?} node {} on {}", args.role, local_node.id, args.bind);

    // 1. Directory, transport and table server:
    let directory = ClusterDirectory::new(local_node.clone());
    let transport: Arc<dyn Transport> =
        Arc::new(HttpTransport::new(directory.clone(), args.transport_config()));
    let server = TableServer::new(directory.clone());

    // 2. Tables (identical on every node):
    let descriptor = TableDescriptor::<i32, Vec<f32>>::new(PARAMS_TABLE, args.shards)
        .with_sharder(ModSharder)
        .with_accumulator(ElementwiseSum)
        .with_flush_threshold(args.flush_threshold);
    let params = server.create_table(descriptor, transport.clone());

    // 3. Assignment collection must be open before peers can reach us:
    let assigner = (args.role == NodeRole::Coordinator)
        .then(|| ShardAssigner::new(server.clone(), transport.clone(), args.expect));

    // 4. HTTP server:
    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("Failed to bind {}", args.bind))?;
    let app = router(server.clone());
    tracing::info!("Table server listening on {}", args.bind);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("HTTP server stopped: {}", e);
        }
    });

    // 5. Spawn stats reporter:
    let stats_server = server.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));

        loop {
            interval.tick().await;
            for stats in stats_server.stats() {
                tracing::info!(
                    "Table {} stats: {}/{} shards local, {} entries, {} pending writes ({} bytes)",
                    stats.table_id,
                    stats.local_shards,
                    stats.num_shards,
                    stats.table_size,
                    stats.pending_writes,
                    stats.pending_write_bytes
                );
            }
        }
    });

    // 6. Shard assignment, released only once every node applied it:
    let coordinator_id = NodeId::coordinator();
    match &assigner {
        Some(assigner) => {
            assigner.run().await?;
        }
        None => {
            let coordinator = NodeInfo {
                id: coordinator_id.clone(),
                // validate() guarantees the address for non-coordinators.
                addr: args
                    .coordinator
                    .context("--coordinator is required")?,
                role: NodeRole::Coordinator,
            };
            register_with_coordinator(
                transport.as_ref(),
                &coordinator,
                &local_node,
                Duration::from_millis(150),
            )
            .await?;
            server.wait_for_assignment().await;
        }
    }

    // 7. Initial data set, written by the coordinator before anyone reads:
    if let Some(assigner) = &assigner {
        load_data(&params, &args).await?;
        assigner.signal_all(ControlSignal::LoadComplete).await?;
    } else {
        server.wait_for_stage(NodeStage::Loaded).await;
    }
    print_table_stats(&server);

    // 8. Workload, then end/shutdown handshake:
    match &assigner {
        Some(assigner) => {
            tokio::select! {
                result = assigner.shutdown_cluster() => result?,
                _ = tokio::signal::ctrl_c() => tracing::warn!("Interrupted before every node ended"),
            }
        }
        None => {
            if args.role == NodeRole::Worker {
                run_workload(&params, &args).await?;
            }
            params.flush().await?;
            report_end(transport.as_ref(), &coordinator_id, &local_node.id).await?;
            tracing::info!("Waiting for shutdown");
            tokio::select! {
                _ = server.wait_for_stage(NodeStage::Shutdown) => {}
                _ = tokio::signal::ctrl_c() => tracing::warn!("Interrupted before shutdown"),
            }
        }
    }

    let flushed = params.flush().await?;
    tracing::info!("Flushed {} pending writes, shutting down", flushed);
    Ok(())
}

/// Puts a random vector under every key.
async fn load_data(params: &TypedTable<i32, Vec<f32>>, args: &NodeArgs) -> anyhow::Result<()> {
    let started = Instant::now();
    for key in 0..args.keys {
        let value: Vec<f32> = (0..args.dim).map(|_| rand::random::<f32>()).collect();
        params.put(key, value).await?;
    }
    params.flush().await?;
    tracing::info!("Loaded {} keys in {:?}", args.keys, started.elapsed());
    Ok(())
}

fn print_table_stats(server: &TableServer) {
    for stats in server.stats() {
        tracing::info!(
            "Table {} on {}: {} entries in {}/{} local shards",
            stats.table_id,
            server.local_node().id,
            stats.table_size,
            stats.local_shards,
            stats.num_shards
        );
    }
}

/// Reads every key asynchronously, then pushes an update for every key.
async fn run_workload(params: &TypedTable<i32, Vec<f32>>, args: &NodeArgs) -> anyhow::Result<()> {
    let delta = vec![1.0f32; args.dim];

    for iteration in 0..args.iterations {
        let started = Instant::now();
        for key in 0..args.keys {
            params.async_get(&key)?;
        }
        let mut found = 0usize;
        for key in 0..args.keys {
            if params
                .collect_with_backoff(&key, Duration::from_millis(1))
                .await?
                .is_some()
            {
                found += 1;
            }
        }
        let read_elapsed = started.elapsed();

        let started = Instant::now();
        for key in 0..args.keys {
            params.update(key, delta.clone()).await?;
        }
        params.flush().await?;
        let write_elapsed = started.elapsed();

        tracing::info!(
            "Iteration {}: read {} keys ({} present) in {:?}, updated {} keys in {:?} ({:.0} updates/s)",
            iteration,
            args.keys,
            found,
            read_elapsed,
            args.keys,
            write_elapsed,
            args.keys as f64 / write_elapsed.as_secs_f64().max(f64::EPSILON)
        );
    }
    Ok(())
}
