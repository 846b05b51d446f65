use std::process;

use clap::Parser;
use colored::Colorize;

use amplicora::cli::Args;
use amplicora::run;

fn main() {
    let args = Args::parse();

    eprintln!(
        "{}: {}  {}: {}",
        "forward".bold(),
        args.forward.blue().bold(),
        "reverse".bold(),
        args.reverse.blue().bold()
    );
    eprintln!(
        "{}: {}",
        "reads".bold(),
        args.reads.join(" ").underline().blue()
    );
    eprintln!(
        "{}: {}",
        "output".bold(),
        args.output.display().to_string().blue().bold()
    );
    eprintln!();

    match run::run(&args) {
        Ok(summary) => {
            eprintln!();
            eprintln!(
                "{}: {} amplicons ({} discards) in {:.1}s",
                "done".green().bold(),
                summary.kept.to_string().bold(),
                summary.discarded,
                summary.elapsed_secs
            );
        }
        Err(err) => {
            eprintln!(
                "{}\n {}",
                "Application error:".red().bold(),
                err.to_string().red()
            );
            process::exit(1);
        }
    }
}
