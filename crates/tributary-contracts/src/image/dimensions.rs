use super::settings::AspectRatio;

/// Output size for one image of a batch.
///
/// The long side starts at `base_dimension`. If the whole batch would go over
/// `max_total_mp` megapixels, both sides are scaled by the same factor so the
/// aggregate lands at or under the ceiling.
pub fn calculate_dimensions(
    aspect_ratio: AspectRatio,
    num_outputs: u32,
    max_total_mp: f64,
    base_dimension: u32,
) -> (u32, u32) {
    let ratio_w = aspect_ratio.width.max(1) as u64;
    let ratio_h = aspect_ratio.height.max(1) as u64;
    let base = base_dimension as u64;
    let (width, height) = if ratio_w > ratio_h {
        (base, base * ratio_h / ratio_w)
    } else {
        (base * ratio_w / ratio_h, base)
    };

    let outputs = num_outputs.max(1) as f64;
    let per_image_mp = (width * height) as f64 / 1_000_000.0;
    let total_mp = per_image_mp * outputs;
    if total_mp <= max_total_mp || per_image_mp <= 0.0 {
        return (width as u32, height as u32);
    }

    let scale = (max_total_mp / outputs / per_image_mp).sqrt();
    (
        (width as f64 * scale) as u32,
        (height as f64 * scale) as u32,
    )
}

pub fn total_megapixels(width: u32, height: u32, num_outputs: u32) -> f64 {
    width as f64 * height as f64 * num_outputs as f64 / 1_000_000.0
}
