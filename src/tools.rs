/// Miscellaneous functions that are used in other parts of the program
use core::ops::{Add, Div, Mul, Sub};

use ndarray::ArrayView1;
use ndarray_stats::QuantileExt;

use crate::error::{GprError, Result};

/// Interpolate an arbitrary amount of independent values between two known points
///
/// # Arguments
/// - `x0`: The first known explanatory variable
/// - `y0`: The first known independent variables
/// - `x1`: The second known explanatory variable
/// - `y1`: The second known independent variables
/// - `x`: The explanatory point at which to interpolate the independent variables
///
/// # Returns
/// The interpolated independent (y) values.
///
/// # Examples
/// ```
/// use gprtopo::tools::interpolate_values;
/// assert_eq!(interpolate_values(0_f32, &[0., 5.], 1., &[-1., 10.], 0.5), &[-0.5, 7.5]);
/// ```
///
/// # Panics
/// - The first slice of independent values is longer than the second: `y0.len()` > `y1.len()`
pub fn interpolate_values<
    T: Add<Output = T> + Sub<Output = T> + Mul<Output = T> + Div<Output = T> + Copy,
>(
    x0: T,
    y0: &[T],
    x1: T,
    y1: &[T],
    x: T,
) -> Vec<T> {
    (0..y0.len())
        .map(|i| interpolate_between_known((x0, y0[i]), (x1, y1[i]), x))
        .collect::<Vec<T>>()
}

/// Interpolate linearly between two known points
///
/// https://en.wikipedia.org/wiki/Linear_interpolation#Linear_interpolation_between_two_known_points
///
/// The formula works just as well outside of the two points, which is used for extrapolation.
///
/// # Arguments
/// - `known_xy0`: The first known point as (explanatory, independent)
/// - `known_xy1`: The second known point as (explanatory, independent)
/// - `x`: The explanatory point at which to interpolate the independent variables
///
/// # Returns
/// The interpolated independent (y) value.
pub fn interpolate_between_known<
    T: Add<Output = T> + Sub<Output = T> + Mul<Output = T> + Div<Output = T> + Copy,
>(
    known_xy0: (T, T),
    known_xy1: (T, T),
    x: T,
) -> T {
    (known_xy0.1 * (known_xy1.0 - x) + known_xy1.1 * (x - known_xy0.0))
        / (known_xy1.0 - known_xy0.0)
}

/// Find the segment of a strictly increasing sequence that should be used to interpolate `x`
///
/// Values outside of the sequence get the first or last segment, so that the caller extrapolates
/// the boundary trend.
///
/// # Returns
/// The index `i` of the segment `known_x[i]..known_x[i + 1]`
fn segment_index(known_x: &[f64], x: f64) -> usize {
    let upper = known_x.partition_point(|v| *v <= x);

    upper.clamp(1, known_x.len() - 1) - 1
}

/// Linearly interpolate (or extrapolate) a value from a table of known values
///
/// # Arguments
/// - `known_x`: Strictly increasing explanatory values. At least two are needed.
/// - `known_y`: The independent values at each `known_x`
/// - `x`: The point to interpolate at
///
/// # Returns
/// The interpolated value. Outside of `known_x`, the trend of the nearest segment is extended.
///
/// # Examples
/// ```
/// use gprtopo::tools::interpolate_linear;
/// assert_eq!(interpolate_linear(&[0., 2.], &[0., 4.], 1.), 2.);
/// assert_eq!(interpolate_linear(&[0., 2.], &[0., 4.], 3.), 6.);
/// ```
///
/// # Panics
/// - If fewer than two known values are given.
pub fn interpolate_linear(known_x: &[f64], known_y: &[f64], x: f64) -> f64 {
    let i = segment_index(known_x, x);

    interpolate_between_known((known_x[i], known_y[i]), (known_x[i + 1], known_y[i + 1]), x)
}

/// Linearly interpolate several independent variables at once (e.g. the x/y/z of a track)
///
/// Same rules as [interpolate_linear].
pub fn interpolate_linear_values<const N: usize>(
    known_x: &[f64],
    known_y: &[[f64; N]],
    x: f64,
) -> [f64; N] {
    let i = segment_index(known_x, x);

    let mut output = [0_f64; N];
    output.copy_from_slice(&interpolate_values(
        known_x[i],
        &known_y[i],
        known_x[i + 1],
        &known_y[i + 1],
        x,
    ));
    output
}

/// Find the index of the value in an axis that is closest to the given value
///
/// NaNs in the axis are ignored.
pub fn nearest_index(axis: ArrayView1<f64>, value: f64) -> Result<usize> {
    axis.mapv(|v| (v - value).abs())
        .argmin_skipnan()
        .map_err(|e| {
            GprError::InsufficientData(format!("Cannot find the index nearest to {value}: {e}"))
        })
}

/// Normalize a 2D vector to unit length
///
/// # Returns
/// None if the vector has no length (or is not finite).
pub fn normalize(vector: [f64; 2]) -> Option<[f64; 2]> {
    let norm = vector[0].hypot(vector[1]);

    if !norm.is_finite() || norm == 0. {
        return None;
    };
    Some([vector[0] / norm, vector[1] / norm])
}

/// Cumulative straight-line distance along a sequence of points, starting at zero
///
/// # Examples
/// ```
/// use gprtopo::tools::cumulative_distance;
/// assert_eq!(cumulative_distance(&[[0., 0.], [3., 4.], [3., 5.]]), vec![0., 5., 6.]);
/// ```
pub fn cumulative_distance<const N: usize>(points: &[[f64; N]]) -> Vec<f64> {
    let mut distances = Vec::with_capacity(points.len());

    let mut total = 0_f64;
    for (i, point) in points.iter().enumerate() {
        if i > 0 {
            total += point
                .iter()
                .zip(points[i - 1].iter())
                .map(|(a, b)| (a - b).powi(2))
                .sum::<f64>()
                .sqrt();
        };
        distances.push(total);
    }
    distances
}

/// Split the argument string of a statement into whitespace-separated tokens
///
/// Single-quoted parts are kept together (whitespace included) and a backslash escapes the
/// next character inside quotes. The quotes are kept in the token so that the caller can tell
/// a string from a bare word.
fn split_arguments(arguments: &str) -> std::result::Result<Vec<String>, String> {
    let mut tokens = Vec::<String>::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = arguments.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' if in_quotes => match chars.next() {
                Some(escaped) => {
                    current.push('\\');
                    current.push(escaped)
                }
                None => return Err(format!("Dangling escape in arguments: {arguments}")),
            },
            '\'' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            c if c.is_whitespace() & !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if in_quotes {
        return Err(format!("Unterminated quote in arguments: {arguments}"));
    };
    if !current.is_empty() {
        tokens.push(current);
    };

    Ok(tokens)
}

/// Parse a statement of the form `name(arg0 arg1 key=value)` into its name and raw arguments
///
/// # Examples
/// ```
/// use gprtopo::tools::parse_statement;
/// assert_eq!(parse_statement("dewow(5)"), Ok(("dewow".to_string(), vec!["5".to_string()])));
/// assert_eq!(parse_statement("time_zero_adjust"), Ok(("time_zero_adjust".to_string(), vec![])));
/// ```
///
/// # Returns
/// - Ok((name, arguments)) where the arguments are unparsed tokens (quotes kept)
/// - Err(e) if the parentheses or quotes do not match up
pub fn parse_statement(string: &str) -> std::result::Result<(String, Vec<String>), String> {
    match string.split_once('(') {
        None => {
            let name = string.trim();
            if name.is_empty() || name.contains(char::is_whitespace) {
                return Err(format!("Invalid statement: {string}"));
            };
            Ok((name.to_string(), Vec::new()))
        }
        Some((name, rest)) => match rest.trim_end().strip_suffix(')') {
            Some(within_parentheses) => {
                let name = name.trim();
                if name.is_empty() {
                    return Err(format!("Statement has no name: {string}"));
                };
                Ok((name.to_string(), split_arguments(within_parentheses)?))
            }
            None => Err(format!(
                "String: {} has opening parenthesis but not closing",
                string
            )),
        },
    }
}

/// Parse a list of steps, either given as a comma separated string or as a filepath
///
/// A file is read line by line. Blank lines and lines starting with '#' are skipped.
/// In a comma separated string, commas within quotes or parentheses do not split.
pub fn parse_step_list(text: &str) -> std::result::Result<Vec<String>, String> {
    let path = std::path::Path::new(text);
    if path.is_file() {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Could not read step file {:?}: {e}", path))?;

        return Ok(content
            .lines()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty() && !s.starts_with('#'))
            .map(|s| s.to_string())
            .collect());
    };

    let mut steps = Vec::<String>::new();
    let mut current = String::new();
    let mut depth = 0_usize;
    let mut in_quotes = false;
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' if in_quotes => {
                current.push(c);
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                };
                continue;
            }
            '\'' => in_quotes = !in_quotes,
            '(' if !in_quotes => depth += 1,
            ')' if !in_quotes => depth = depth.saturating_sub(1),
            ',' if !in_quotes & (depth == 0) => {
                steps.push(std::mem::take(&mut current));
                continue;
            }
            _ => (),
        }
        current.push(c);
    }
    steps.push(current);

    if in_quotes | (depth != 0) {
        return Err(format!("Unbalanced quotes or parentheses in step list: {text}"));
    };

    Ok(steps
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect())
}
