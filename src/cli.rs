// Command line interface module
// Handles parsing of command line arguments and the usage/exit policy

use crate::error::OverlayError;
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use smithay_client_toolkit::shell::wlr_layer::Anchor;
use std::ffi::OsString;
use std::path::PathBuf;

/// Namespace announced to the compositor for the layer surface
pub const DEFAULT_NAMESPACE: &str = "lwr";

/// lwr - get an overlay of your choice on your Wayland compositor
#[derive(Parser, Debug)]
#[command(name = "lwr")]
#[command(version, about, long_about = None, disable_help_flag = true)]
#[command(after_help = "Example:\n  lwr /path/to/image.png -w 240 -m 8 -a top:middle")]
pub struct Args {
    /// Path to the image file
    #[arg(value_name = "IMAGE")]
    pub image_path: PathBuf,

    /// Width of the overlay (default: image width)
    #[arg(short, long, default_value_t = 0)]
    pub width: u32,

    /// Height of the overlay (default: image height)
    #[arg(short = 'h', long, default_value_t = 0)]
    pub height: u32,

    /// Margin between the overlay and the anchored edges
    #[arg(short, long, default_value_t = 0, allow_negative_numbers = true)]
    pub margin: i32,

    /// Anchors of the overlay: (top|middle|bottom):(left|middle|right)
    #[arg(short, long, value_name = "ANCHOR", default_value = "top:left", value_parser = parse_anchor)]
    pub anchor: Anchor,

    /// Name of the output to show the overlay on (default: compositor's choice)
    #[arg(short, long)]
    pub output: Option<String>,

    /// Namespace of the layer surface
    #[arg(long, default_value = DEFAULT_NAMESPACE)]
    pub namespace: String,

    /// Print help
    #[arg(long, action = clap::ArgAction::Help)]
    #[allow(dead_code)]
    help: Option<bool>,
}

/// Parsed arguments with the image path checked
#[derive(Debug)]
pub struct ParsedArgs {
    pub image_path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub margin: i32,
    pub anchor: Anchor,
    pub output: Option<String>,
    pub namespace: String,
}

/// Parse an anchor pair such as `top:left` or `middle:right`.
///
/// `middle` on an axis anchors both opposing edges, which centers the
/// surface along that axis.
pub fn parse_anchor(s: &str) -> Result<Anchor, String> {
    let (vertical, horizontal) = s
        .split_once(':')
        .ok_or_else(|| format!("invalid anchor '{s}', expected <vertical>:<horizontal>"))?;

    let vertical = match vertical {
        "top" => Anchor::TOP,
        "middle" => Anchor::TOP | Anchor::BOTTOM,
        "bottom" => Anchor::BOTTOM,
        _ => return Err(format!("invalid vertical anchor '{vertical}'")),
    };
    let horizontal = match horizontal {
        "left" => Anchor::LEFT,
        "middle" => Anchor::LEFT | Anchor::RIGHT,
        "right" => Anchor::RIGHT,
        _ => return Err(format!("invalid horizontal anchor '{horizontal}'")),
    };

    Ok(vertical | horizontal)
}

/// Usage text printed on any argument error
pub fn usage() -> String {
    Args::command().render_help().to_string()
}

/// Parse an explicit argument list. Help and version requests are
/// reported as `Ok(None)` after printing.
pub fn parse_from<I, T>(itr: I) -> Result<Option<ParsedArgs>, OverlayError>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let args = match Args::try_parse_from(itr) {
        Ok(args) => args,
        Err(err) => match err.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                let _ = err.print();
                return Ok(None);
            }
            _ => return Err(OverlayError::Argument(first_line(&err.to_string()))),
        },
    };

    // Check the file before any decoding is attempted
    if !args.image_path.exists() {
        return Err(OverlayError::FileNotFound(args.image_path));
    }

    Ok(Some(ParsedArgs {
        image_path: args.image_path,
        width: args.width,
        height: args.height,
        margin: args.margin,
        anchor: args.anchor,
        output: args.output,
        namespace: args.namespace,
    }))
}

/// Parse the process arguments.
///
/// Argument errors print the usage to standard output and exit with
/// status 1; help and version exit with status 0.
pub fn parse_args() -> Result<ParsedArgs, OverlayError> {
    match parse_from(std::env::args_os()) {
        Ok(Some(args)) => Ok(args),
        Ok(None) => std::process::exit(0),
        Err(err @ OverlayError::Argument(_)) => {
            print!("{}", usage());
            eprintln!("lwr: error: {err}");
            std::process::exit(err.exit_code());
        }
        Err(err) => Err(err),
    }
}

fn first_line(message: &str) -> String {
    let line = message.lines().next().unwrap_or_default();
    line.strip_prefix("error: ").unwrap_or(line).to_string()
}
