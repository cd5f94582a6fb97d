use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info};

use open_relay::{
    audio::{
        player::{PlaybackManager, SessionDeps},
        transcode::{FfmpegConfig, FfmpegTranscoder},
    },
    bot,
    cache::CachedResolver,
    config::Config,
    sources::{direct_url::DirectUrlResolver, ytdlp::YtDlpResolver, SmartResolver},
    voice::gateway::TcpGateway,
};

/// Intervalo de limpieza de la caché de resoluciones
const CACHE_CLEANUP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("open_relay=debug".parse()?)
                .add_directive("reqwest=info".parse()?),
        )
        .init();

    info!("🎵 Iniciando Open Relay v{}", env!("CARGO_PKG_VERSION"));

    // Cargar configuración
    let config = Config::load()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .enable_all()
        .build()?;

    // Manejar health check si es necesario
    if std::env::args().any(|arg| arg == "--health-check") {
        return runtime.block_on(health_check(&config));
    }

    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<()> {
    info!("⚙️ Configuración:\n{}", config.summary());
    let config = Arc::new(config);

    // Resolución con caché
    let mut direct = DirectUrlResolver::new(config.resolve_timeout())?;
    if let Some(root) = &config.media_root {
        direct = direct.with_media_root(root)?;
    }

    let resolver = Arc::new(CachedResolver::new(
        SmartResolver::new(
            direct,
            YtDlpResolver::new(config.ytdlp_path.clone(), config.resolve_timeout()),
        ),
        config.cache_size,
        config.cache_ttl(),
    ));

    let transcoder = Arc::new(FfmpegTranscoder::new(FfmpegConfig {
        program: config.ffmpeg_path.clone(),
        format: config.audio_format(),
        bitrate: config.opus_bitrate as i32,
        feed_capacity: config.lookahead_frames,
        stop_grace: config.stop_grace(),
    }));

    let gateway = Arc::new(TcpGateway::new(config.connect_timeout()));

    let manager = Arc::new(PlaybackManager::new(SessionDeps {
        config: config.clone(),
        resolver: resolver.clone(),
        transcoder,
        gateway,
    }));

    // Mantenimiento periódico de la caché
    let cleanup_resolver = resolver.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CACHE_CLEANUP_INTERVAL);
        loop {
            interval.tick().await;
            cleanup_resolver.cache().cleanup_old_entries();
        }
    });

    // Manejar shutdown graceful
    let signal_manager = manager.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Error al registrar Ctrl+C: {}", e);
            return;
        }
        info!("⚠️ Señal de shutdown recibida, cerrando...");
        signal_manager.shutdown().await;
        std::process::exit(0);
    });

    info!("🚀 Relay iniciado exitosamente");
    if let Err(why) = bot::run_console(manager.clone()).await {
        error!("Error en la consola: {:?}", why);
    }

    manager.shutdown().await;
    let metrics = resolver.cache().metrics();
    info!(
        "📊 Caché: {} aciertos, {} fallos ({:.1}% hit rate)",
        metrics.hits,
        metrics.misses,
        metrics.hit_rate() * 100.0
    );
    Ok(())
}

async fn health_check(config: &Config) -> Result<()> {
    // Verificar dependencias críticas
    let yt_dlp = async_process::Command::new(&config.ytdlp_path)
        .arg("--version")
        .output()
        .await?;

    let ffmpeg = async_process::Command::new(&config.ffmpeg_path)
        .arg("-version")
        .output()
        .await?;

    if yt_dlp.status.success() && ffmpeg.status.success() {
        println!("OK");
        Ok(())
    } else {
        anyhow::bail!("Dependencias faltantes");
    }
}
