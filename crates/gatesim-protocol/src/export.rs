//! Text exports: QuB-style dwell-time files and tab-separated curve dumps.
//! Both formats use CRLF line endings for compatibility with the Windows
//! analysis tools that consume them.

use std::fmt::Write as _;
use std::fs;
use std::io::Write;
use std::path::Path;

use gatesim_core::Result;

use crate::Protocol;

/// Save every cell's Monte Carlo event chains as `.dwt` dwell-time files,
/// one file per `(variable set, row, column)` named
/// `"<stem> (set,row,col).dwt"`.
///
/// Each run becomes one 1-based segment; the dwell count excludes the
/// trailing closing event and dwells are written in milliseconds.
pub fn save_event_chains_dwt(protocol: &Protocol, path_stem: impl AsRef<Path>) -> Result<()> {
    let stem = path_stem.as_ref().to_string_lossy();
    let stem = stem.strip_suffix(".dwt").unwrap_or(&stem);
    for (row, sim_row) in protocol.simulations.iter().enumerate() {
        for (col, sim) in sim_row.iter().enumerate() {
            for (set_index, chains) in sim.events.iter().enumerate() {
                if chains.is_empty() {
                    continue;
                }
                let mut out = String::new();
                for (segment, chain) in chains.iter().enumerate() {
                    let _ = write!(
                        out,
                        "Segment: {} Dwells: {} Sampling(ms): 1\r\n",
                        segment + 1,
                        chain.len().saturating_sub(1)
                    );
                    for event in chain {
                        let _ = write!(out, "{}\t{}\r\n", event.state, event.duration * 1000.0);
                    }
                    out.push_str("\r\n");
                }
                let path = format!("{stem} ({set_index},{row},{col}).dwt");
                fs::write(path, out)?;
            }
        }
    }
    Ok(())
}

/// A plotted curve: paired X/Y samples with their axis titles.
#[derive(Debug, Clone)]
pub struct Curve {
    pub x_title: String,
    pub y_title: String,
    pub x: Vec<f64>,
    pub y: Vec<f64>,
}

/// Write visible curves as tab-separated text: a title row
/// `Xtitle\tYtitle` per curve, then one row per sample.
///
/// All written curves share the first curve's sample count; curves of any
/// other length are dropped.
pub fn write_curves<W: Write>(mut out: W, curves: &[Curve]) -> Result<()> {
    let first = match curves.first() {
        Some(first) => first,
        None => return Ok(()),
    };
    let num_pts = first.y.len();
    let visible: Vec<&Curve> = curves
        .iter()
        .filter(|curve| curve.x.len() == num_pts && curve.y.len() == num_pts)
        .collect();
    let titles: Vec<String> = visible
        .iter()
        .map(|curve| format!("{}\t{}", curve.x_title, curve.y_title))
        .collect();
    write!(out, "{}\r\n", titles.join("\t"))?;
    for k in 0..num_pts {
        let fields: Vec<String> = visible
            .iter()
            .map(|curve| format!("{}\t{}", curve.x[k], curve.y[k]))
            .collect();
        write!(out, "{}\r\n", fields.join("\t"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn curve(y_title: &str, y: Vec<f64>) -> Curve {
        Curve {
            x_title: "t".to_string(),
            y_title: y_title.to_string(),
            x: (0..y.len()).map(|k| k as f64).collect(),
            y,
        }
    }

    #[test]
    fn test_write_curves() {
        let mut out = Vec::new();
        write_curves(
            &mut out,
            &[
                curve("a", vec![1.0, 2.0]),
                curve("b", vec![3.0, 4.0]),
                curve("short", vec![5.0]), // dropped: length mismatch
            ],
        )
        .unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.split("\r\n").collect();
        assert_eq!(lines[0], "t\ta\tt\tb");
        assert_eq!(lines[1], "0\t1\t0\t3");
        assert_eq!(lines[2], "1\t2\t1\t4");
        assert_eq!(lines[3], "");
    }

    #[test]
    fn test_write_no_curves() {
        let mut out = Vec::new();
        write_curves(&mut out, &[]).unwrap();
        assert!(out.is_empty());
    }
}
