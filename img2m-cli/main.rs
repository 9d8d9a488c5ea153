use img2m_cli::{load_features, options::log_level_filter, ConfigDocument, Img2MatchesPipeline, PipelineError, PipelineOptions, PipelineResult};
use img2m_core::collect_image_records;
use log::*;
use std::path::PathBuf;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "img2matches", about = "Extracts features from a directory of images and matches every view pair")]
struct Opt {
    /// TOML configuration with an [img2matches] table and per-method sections
    #[structopt(short, long, parse(from_os_str))]
    config: Option<PathBuf>,
    /// Reuse keypoints from an exported features_all.json (file or directory)
    #[structopt(short, long, parse(from_os_str))]
    features: Option<PathBuf>,
    /// Worker threads, overrides num_threads
    #[structopt(short, long)]
    threads: Option<usize>,
    /// Detector type, e.g. SIFT, ORB, AKAZE
    #[structopt(short, long)]
    detector: Option<String>,
    /// Matcher type, e.g. FASTCASCADEHASHINGL2, FLANN, BF_HAMMING
    #[structopt(short, long)]
    matcher: Option<String>,
    /// Run mode: fast or viewer
    #[structopt(long)]
    mode: Option<String>,
    /// Export features and matches into this directory
    #[structopt(short, long, parse(from_os_str))]
    output: Option<PathBuf>,
    /// Write the effective configuration to this file and exit
    #[structopt(long, parse(from_os_str))]
    dump_config: Option<PathBuf>,
    /// Directory of input images, required unless only dumping the config
    #[structopt(short, long, parse(from_os_str))]
    images: Option<PathBuf>,
}

fn main() {
    let opt = Opt::from_args();
    let doc = match load_document(&opt) {
        Ok(doc) => doc,
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    };
    init_logging(&doc);

    if let Err(e) = run(&opt, &doc) {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn load_document(opt: &Opt) -> PipelineResult<ConfigDocument> {
    let mut doc = match &opt.config {
        Some(path) => ConfigDocument::load(path)?,
        None => ConfigDocument::default(),
    };
    if let Some(threads) = opt.threads {
        doc.set("num_threads", threads.to_string());
    }
    if let Some(detector) = &opt.detector {
        doc.set("detector_type", detector.as_str());
    }
    if let Some(matcher) = &opt.matcher {
        doc.set("matcher_type", matcher.as_str());
    }
    if let Some(mode) = &opt.mode {
        doc.set("run_mode", mode.as_str());
    }
    if let Some(output) = &opt.output {
        doc.set("export_features", "ON");
        doc.set("export_fea_path", output.display().to_string());
        doc.set("export_matches", "ON");
        doc.set("export_match_path", output.display().to_string());
    }
    Ok(doc)
}

/// RUST_LOG wins over the configured log_level
fn init_logging(doc: &ConfigDocument) {
    if std::env::var_os("RUST_LOG").is_some() {
        pretty_env_logger::init_timed();
        return;
    }
    let level = doc.main.get("log_level").and_then(|l| l.parse().ok()).unwrap_or(2);
    pretty_env_logger::formatted_timed_builder()
        .filter_level(log_level_filter(level))
        .init();
}

fn run(opt: &Opt, doc: &ConfigDocument) -> PipelineResult<()> {
    let options = PipelineOptions::from_document(doc)?;
    if let Some(path) = &opt.dump_config {
        std::fs::write(path, options.to_document().to_toml_string()?)?;
        info!("Configuration written to {}", path.display());
        return Ok(());
    }

    let dir = opt
        .images
        .as_ref()
        .ok_or_else(|| PipelineError::InputData("--images <dir> is required to run".to_string()))?;
    let images = collect_image_records(dir)?;
    info!("Found {} images in {}", images.len(), dir.display());
    let mut pipeline = Img2MatchesPipeline::new(options, images);
    if let Some(path) = &opt.features {
        pipeline = pipeline.with_features(load_features(path)?);
    }

    let bundle = pipeline.run()?;
    info!(
        "Done: {} views with features, {} keypoints, {} matched pairs, {} matches",
        bundle.features.filled_count(),
        bundle.features.total_keypoints(),
        bundle.matches.len(),
        bundle.matches.total_matches()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Opt {
        Opt::from_iter(std::iter::once("img2matches").chain(args.iter().copied()))
    }

    #[test]
    fn test_dump_config_needs_no_images() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("effective.toml");
        let opt = parse(&["--dump-config", out.to_str().unwrap(), "--threads", "3"]);
        assert!(opt.images.is_none());

        run(&opt, &load_document(&opt).unwrap()).unwrap();
        let written = PipelineOptions::load(&out).unwrap();
        assert_eq!(written.num_threads, 3);
    }

    #[test]
    fn test_run_without_images_fails() {
        let opt = parse(&["--matcher", "BF"]);
        let result = run(&opt, &load_document(&opt).unwrap());
        assert!(matches!(result, Err(PipelineError::InputData(_))));
    }
}
