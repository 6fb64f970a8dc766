//! Logging setup.
//!
//! Every process logs line-per-event to stdout and, in append mode, to
//! `outputfile_{role}_<port>.txt`. Lines carry a `HH:MM:SS` timestamp and a
//! role/port tag. `RUST_LOG` overrides the default `info` filter.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};

use chrono::Local;
use env_logger::Target;
use log::LevelFilter;

struct TeeWriter {
    file: Option<File>,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stdout().write_all(buf)?;
        if let Some(file) = self.file.as_mut() {
            file.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stdout().flush()?;
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
        }
        Ok(())
    }
}

pub fn init_logging(role: &str, port: u16) {
    let path = format!("outputfile_{role}_{port}.txt");
    let file = match OpenOptions::new().create(true).append(true).open(&path) {
        Ok(file) => Some(file),
        Err(err) => {
            eprintln!("Cannot open log file '{path}': {err}. Logging to stdout only.");
            None
        }
    };

    let tag = format!("{} {}_{}", role.to_uppercase(), role, port);
    env_logger::Builder::new()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .format(move |buf, record| {
            writeln!(
                buf,
                "{} [{}] {}",
                Local::now().format("%H:%M:%S"),
                tag,
                record.args()
            )
        })
        .target(Target::Pipe(Box::new(TeeWriter { file })))
        .init();
}
