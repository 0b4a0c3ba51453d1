//! `cotvae reform` — combine pairs of example lines into two-problem lines.
//!
//! ```text
//! cotvae reform --path data/src1_train.txt --out data/src2_train.txt --num-lines 1000
//! ```

use std::path::Path;

use anyhow::{Context, Result};

use cotvae_train::reform::reform_file;

pub fn run(path: &Path, out: &Path, num_lines: usize) -> Result<()> {
    let written = reform_file(path, out, num_lines)
        .with_context(|| format!("Failed to reformat {}", path.display()))?;
    println!("Wrote {written} combined line(s) to {}", out.display());
    Ok(())
}
