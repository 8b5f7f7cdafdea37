//! bobbin demo
//!
//! 同じプロセスの中で worker endpoint（合成した operator list を流す）と
//! host の DocumentProxy を LoopbackChannel でつなぎ、見えているページを描画する。

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bobbin_core::app::actions::{
    CommonObj, GetDestination, GetNumPages, GetOperatorList, ObjectKind, PageObj,
};
use bobbin_core::app::{EndpointBuilder, Role};
use bobbin_core::typed::{Handler, StreamHandler};
use bobbin_core::{
    BobbinError, DocumentProxy, Endpoint, IdGenerator, LoopbackChannel, OperatorListChunk,
    PageSurface, RemoteError, SessionConfig, StreamSink, SystemClock, UlidGenerator, ViewId,
};
use clap::Parser;
use serde_json::{Value, json};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Render a synthetic document through the host/worker protocol
#[derive(Parser, Debug)]
#[command(name = "bobbin")]
#[command(version)]
struct Cli {
    /// Enable verbose logging (-v: debug, -vv: trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Session config (JSON). Missing fields use defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of pages in the synthetic document
    #[arg(long, default_value_t = 6)]
    pages: u32,

    /// Visible pages, zero-based (e.g. --visible 2,3)
    #[arg(long, value_delimiter = ',', default_value = "0,1")]
    visible: Vec<usize>,

    /// Treat the last scroll as upwards
    #[arg(long)]
    scroll_up: bool,

    /// Operator list chunks per page
    #[arg(long, default_value_t = 3)]
    chunks: u32,

    /// Also print every page with the print intent
    #[arg(long)]
    print: bool,

    /// Override stream.high_water_mark
    #[arg(long)]
    high_water_mark: Option<f64>,
}

struct NumPages(u32);

#[async_trait]
impl Handler<GetNumPages> for NumPages {
    async fn handle(&self, _request: GetNumPages) -> Result<u32, BobbinError> {
        Ok(self.0)
    }
}

struct NoDestinations;

#[async_trait]
impl Handler<GetDestination> for NoDestinations {
    async fn handle(&self, _request: GetDestination) -> Result<Option<Value>, BobbinError> {
        Ok(None)
    }
}

/// ページごとに `chunks` 個の chunk を流す合成 producer
struct SyntheticPages {
    chunks: u32,
    worker: Arc<OnceLock<Endpoint>>,
}

#[async_trait]
impl StreamHandler<GetOperatorList> for SyntheticPages {
    async fn handle(
        &self,
        request: GetOperatorList,
        sink: StreamSink<OperatorListChunk>,
    ) -> Result<(), BobbinError> {
        if let Some(worker) = self.worker.get() {
            worker.notify_typed(&CommonObj {
                id: "font-serif".into(),
                kind: ObjectKind::Font,
                data: json!({"family": "Serif"}),
            })?;
            worker.notify_typed(&PageObj {
                id: format!("img-{}", request.page_index),
                page_index: request.page_index,
                kind: ObjectKind::Image,
                data: json!({"width": 16, "height": 16}),
            })?;
        }
        for n in 0..self.chunks {
            let opcodes: Vec<u32> = (0..8).map(|op| n * 8 + op).collect();
            let args = vec![json!({"page": request.page_index}); opcodes.len()];
            sink.enqueue(OperatorListChunk::new(opcodes, args, n + 1 == self.chunks), 1.0)
                .await?;
        }
        Ok(())
    }
}

/// 命令を数えるだけの surface
struct CountingSurface {
    visible: bool,
    executed: Arc<AtomicUsize>,
}

impl PageSurface for CountingSurface {
    fn priority_weight(&self) -> Option<u32> {
        self.visible.then_some(1)
    }

    fn execute_chunk(&mut self, opcodes: &[u32], _args: &[Value], cursor: usize) -> Result<usize, RemoteError> {
        let end = (cursor + 4).min(opcodes.len());
        self.executed.fetch_add(end - cursor, Ordering::Relaxed);
        Ok(end)
    }
}

fn load_config(cli: &Cli) -> Result<SessionConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            SessionConfig::from_json_str(&text).context("invalid session config")?
        }
        None => SessionConfig::default_v1(),
    };
    if let Some(hwm) = cli.high_water_mark {
        config.stream.high_water_mark = hwm;
    }
    config.validate().context("invalid session config")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .init();

    let config = load_config(&cli)?;
    let document = UlidGenerator::new(SystemClock).generate_document_id();
    let (host_port, worker_port) = LoopbackChannel::new();

    // (A) worker: 合成ドキュメントを提供する
    let cell = Arc::new(OnceLock::new());
    let worker = EndpointBuilder::for_document(Role::Worker, document)
        .with_stream_policy(config.stream.clone())
        .register::<GetNumPages, _>(NumPages(cli.pages))?
        .register::<GetDestination, _>(NoDestinations)?
        .register_stream::<GetOperatorList, _>(SyntheticPages {
            chunks: cli.chunks.max(1),
            worker: Arc::clone(&cell),
        })?
        .expect_actions(&["GetNumPages", "GetDestination", "GetOperatorList"])
        .build()?
        .connect(Arc::new(worker_port));
    let _ = cell.set(worker.clone());

    // (B) host: surface は view ごとに 1 つ
    let executed = Arc::new(AtomicUsize::new(0));
    let visible = cli.visible.clone();
    let counter = Arc::clone(&executed);
    let doc = DocumentProxy::open(Arc::new(host_port), document, config, move |view| {
        Box::new(CountingSurface {
            visible: visible.contains(&view.index()),
            executed: Arc::clone(&counter),
        }) as Box<dyn PageSurface>
    })
    .await
    .context("failed to open document")?;
    info!(%document, pages = doc.num_pages(), "document ready");

    // (C) 見えているページを描く
    doc.update_from_surfaces(!cli.scroll_up)?;
    for index in cli.visible.iter().filter(|index| **index < doc.num_pages() as usize) {
        let view = ViewId::new(*index);
        if let Err(err) = doc.wait_rendered(view).await {
            println!("{view}: {err}");
        }
    }

    if cli.print {
        doc.set_printing(true)?;
        for index in 0..doc.num_pages() as usize {
            doc.render_print(ViewId::new(index)).await?;
        }
        doc.set_printing(false)?;
    }

    // (D) 結果
    for report in doc.states().await? {
        match &report.error {
            Some(err) => println!("{} {} {:?} ({err})", report.view, report.intent, report.state),
            None => println!("{} {} {:?}", report.view, report.intent, report.state),
        }
    }
    println!("operators executed: {}", executed.load(Ordering::Relaxed));
    println!("common objects: {}", doc.common_objs().len());
    println!("host counters: {}", serde_json::to_string_pretty(&doc.endpoint().counts())?);
    println!("worker counters: {}", serde_json::to_string_pretty(&worker.counts())?);

    doc.destroy().await;
    worker.destroy();
    Ok(())
}
