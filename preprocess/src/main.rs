use clap::Parser;
use std::process::ExitCode;
use terrain_pyramid_preprocess::{dataset::clear_directory, prelude::*};
use tracing::error;

fn run(args: Cli) -> PreprocessResult<BuildReport> {
    let config = args.tiling_config()?;
    let sources = args.load_sources()?;

    let area = match args.area {
        Some(area) => area,
        None => sources
            .extent()
            .ok_or_else(|| PreprocessError::SourceData("no source layers".into()))?,
    };

    if args.overwrite {
        clear_directory(&config.output)?;
    }

    let progress_bar = PreprocessBar::new("Building".to_string());
    let report = build_pyramid(&sources, area, &config, Some(progress_bar.callback()));
    progress_bar.finish();

    report
}

fn main() -> ExitCode {
    init_logging();

    match run(Cli::parse()) {
        Ok(report) => {
            print!("{report}");
            ExitCode::SUCCESS
        }
        Err(error) => {
            error!("{error}");
            ExitCode::FAILURE
        }
    }
}
