use crate::error::{NNError, Result};
use plotters::prelude::*;
use std::path::Path;

fn plot_err<E: std::error::Error>(e: E) -> NNError {
    NNError::PlotError(e.to_string())
}

/// Renders `(global_step, loss)` pairs as a log-scale PNG line chart.
pub fn plot_loss_history<P: AsRef<Path>>(losses: &[(u64, f64)], filename: P) -> Result<()> {
    if losses.is_empty() {
        return Err(NNError::InvalidArgument("no losses to plot".into()));
    }
    let filename = filename.as_ref();
    let root = BitMapBackend::new(filename, (800, 600)).into_drawing_area();
    root.fill(&WHITE).map_err(plot_err)?;

    // Adjust losses to avoid log of zero or negative numbers
    let log_losses: Vec<(u64, f64)> = losses
        .iter()
        .map(|&(step, loss)| (step, loss.max(1e-10).log10()))
        .collect();

    let first_step = log_losses[0].0;
    let last_step = log_losses[log_losses.len() - 1].0.max(first_step + 1);
    let y_min = log_losses.iter().map(|p| p.1).fold(f64::INFINITY, f64::min).floor();
    let mut y_max = log_losses.iter().map(|p| p.1).fold(f64::NEG_INFINITY, f64::max).ceil();
    if y_max <= y_min {
        y_max = y_min + 1.0;
    }

    let mut chart = ChartBuilder::on(&root)
        .caption("Training Loss (Log Scale)", ("sans-serif", 30).into_font())
        .margin(5)
        .x_label_area_size(50)
        .y_label_area_size(60)
        .build_cartesian_2d(first_step..last_step, y_min..y_max)
        .map_err(plot_err)?;

    chart
        .configure_mesh()
        .x_desc("Global step")
        .y_desc("Loss (Log Scale)")
        .y_label_formatter(&|y| format!("1e{:.0}", y))
        .draw()
        .map_err(plot_err)?;

    chart
        .draw_series(LineSeries::new(log_losses.iter().copied(), &BLUE))
        .map_err(plot_err)?
        .label("Training loss")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &BLUE));

    chart
        .configure_series_labels()
        .background_style(&WHITE.mix(0.8))
        .border_style(&BLACK)
        .draw()
        .map_err(plot_err)?;

    root.present().map_err(plot_err)?;
    tracing::info!(path = %filename.display(), "loss plot saved");

    Ok(())
}
