//! Conditions matrices.
//!
//! Protocol and stimulus parameters are 2-D grids of per-(row, column)
//! values written as strings: rows separated by `;`, columns by `,` or
//! whitespace, with numeric range shorthand `start:stop` (step 1) and
//! `start:step:stop`. A protocol's effective grid size is the maximum over
//! all of its conditions matrices; smaller matrices are padded by repeating
//! their last element along each axis.

/// A jagged 2-D grid of per-condition values.
pub type Grid<T> = Vec<Vec<T>>;

/// Parse one row of numeric values, expanding range shorthand.
///
/// Unparseable fields are ignored, matching the lenient treatment of
/// user-edited condition strings elsewhere in the engine.
pub fn parse_series(s: &str) -> Vec<f64> {
    let mut values = Vec::new();
    for field in s
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|field| !field.is_empty())
    {
        let parts: Vec<&str> = field.split(':').filter(|p| !p.is_empty()).collect();
        match parts.as_slice() {
            [value] => {
                if let Ok(v) = value.parse::<f64>() {
                    values.push(v);
                }
            }
            [start, stop] => {
                if let (Ok(start), Ok(stop)) = (start.parse::<f64>(), stop.parse::<f64>()) {
                    let mut v = start;
                    while v <= stop {
                        values.push(v);
                        v += 1.0;
                    }
                }
            }
            [start, step, stop] => {
                if let (Ok(start), Ok(step), Ok(stop)) =
                    (start.parse::<f64>(), step.parse::<f64>(), stop.parse::<f64>())
                {
                    if step > 0.0 {
                        let mut v = start;
                        while v <= stop {
                            values.push(v);
                            v += step;
                        }
                    } else if step < 0.0 {
                        let mut v = start;
                        while v >= stop {
                            values.push(v);
                            v += step;
                        }
                    }
                }
            }
            _ => {}
        }
    }
    values
}

/// Parse one row of string values. Ranges make no sense for strings, so
/// fields are taken verbatim.
pub fn parse_str_series(s: &str) -> Vec<String> {
    s.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|field| !field.is_empty())
        .map(String::from)
        .collect()
}

/// Parse a 2-D numeric grid: rows split on `;`, then [`parse_series`].
pub fn parse_grid(s: &str) -> Grid<f64> {
    s.split(';')
        .map(parse_series)
        .filter(|row| !row.is_empty())
        .collect()
}

/// Parse a 2-D string grid: rows split on `;`, then [`parse_str_series`].
pub fn parse_str_grid(s: &str) -> Grid<String> {
    s.split(';')
        .map(parse_str_series)
        .filter(|row| !row.is_empty())
        .collect()
}

/// Grow `rows`/`cols` to cover the given grid.
pub fn grid_limits<T>(grid: &Grid<T>, rows: &mut usize, cols: &mut usize) {
    *rows = (*rows).max(grid.len());
    for row in grid {
        *cols = (*cols).max(row.len());
    }
}

/// Pad (or truncate) a grid to exactly `rows` x `cols`. Missing entries
/// repeat the last element along each axis; an entirely missing grid is
/// filled with the default.
pub fn pad_grid<T: Clone>(grid: &mut Grid<T>, rows: usize, cols: usize, default: T) {
    for row in grid.iter_mut() {
        if row.is_empty() {
            row.push(default.clone());
        }
        while row.len() < cols {
            let last = row[row.len() - 1].clone();
            row.push(last);
        }
        row.truncate(cols);
    }
    if grid.is_empty() {
        grid.push(vec![default; cols]);
    }
    while grid.len() < rows {
        let last = grid[grid.len() - 1].clone();
        grid.push(last);
    }
    grid.truncate(rows);
}
