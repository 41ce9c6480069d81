//! `scan`: what the engine would track

use crate::cli::ScanArgs;
use crate::error::Result;
use crate::scanner::Scanner;

use super::CommandContext;

pub fn run_scan(ctx: &CommandContext, args: &ScanArgs) -> Result<String> {
    let scanner = Scanner::new(&ctx.root, &ctx.config.sync)?;
    let report = match args.dir.as_deref() {
        Some(dir) => scanner.scan_dir(dir.trim_start_matches("./").trim_end_matches('/')),
        None => scanner.scan(),
    };

    ctx.render(&report, |report| {
        let mut out = String::new();
        for file in &report.files {
            out.push_str(&format!(
                "{}  {:>9}  {}\n",
                &file.content_hash[..file.content_hash.len().min(12)],
                file.size,
                file.path
            ));
        }
        let bytes: u64 = report.files.iter().map(|f| f.size).sum();
        out.push_str(&format!(
            "{} files, {} bytes ({} too large, {} unreadable)\n",
            report.files.len(),
            bytes,
            report.skipped_too_large,
            report.failed
        ));
        out
    })
}
