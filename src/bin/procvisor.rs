use procvisor::logging::init_tracing;
use procvisor::ui::{MessageBlock, OutputMode, PlainRenderer};
use procvisor::{parse_command, print_usage, Command};

fn main() {
    init_tracing();
    let args: Vec<String> = std::env::args().skip(1).collect();
    let output_mode = OutputMode::from_env();
    let cmd = match parse_command(args) {
        Ok(cmd) => cmd,
        Err(err) => {
            let mut renderer = PlainRenderer::stderr(output_mode);
            let _ = renderer.error_block(
                &MessageBlock::new("Invalid command arguments", err.to_string())
                    .with_hint("Run `procvisor --help` to see supported command forms"),
            );
            print_usage();
            std::process::exit(2);
        }
    };

    match cmd {
        Command::Help => print_usage(),
        Command::Run(args) => match procvisor::runner::run_command(args, output_mode) {
            Ok(report) if report.succeeded() => {}
            Ok(_) => std::process::exit(1),
            Err(err) => {
                let mut renderer = PlainRenderer::stderr(output_mode);
                let _ = renderer.error_block(&MessageBlock::new("Run failed", err.to_string()));
                std::process::exit(1);
            }
        },
    }
}
