//! Computes the `scale`/`pad` video filter for a target aspect ratio.

const FALLBACK_FILTER: &str = "scale=-2:1080:force_original_aspect_ratio=decrease,setsar=1";
const TARGET_LONG_EDGE: f64 = 1920.0;

/// Parse `W:H` and build the video filter string. An unparseable or
/// zero/negative ratio falls back to a fixed 1080p-height filter.
pub fn aspect_ratio_filter(aspect_ratio: &str) -> String {
    match parse_ratio(aspect_ratio) {
        Some((w, h)) => build_scale_pad_filter(w, h),
        None => FALLBACK_FILTER.to_string(),
    }
}

fn parse_ratio(input: &str) -> Option<(f64, f64)> {
    let (w_str, h_str) = input.split_once(':')?;
    let w: f64 = w_str.trim().parse().ok()?;
    let h: f64 = h_str.trim().parse().ok()?;
    if w <= 0.0 || h <= 0.0 {
        return None;
    }
    Some((w, h))
}

fn build_scale_pad_filter(w: f64, h: f64) -> String {
    let (target_w, target_h) = if w >= h {
        let width = TARGET_LONG_EDGE;
        let height = TARGET_LONG_EDGE * h / w;
        (round_even_at_least_2(width), round_even_at_least_2(height))
    } else {
        let height = TARGET_LONG_EDGE;
        let width = TARGET_LONG_EDGE * w / h;
        (round_even_at_least_2(width), round_even_at_least_2(height))
    };

    format!(
        "scale={tw}:-2:force_original_aspect_ratio=decrease,pad={tw}:{th}:(ow-iw)/2:(oh-ih)/2,setsar=1",
        tw = target_w,
        th = target_h,
    )
}

fn round_even_at_least_2(value: f64) -> u32 {
    let rounded = value.round() as i64;
    let even = if rounded % 2 == 0 { rounded } else { rounded + 1 };
    even.max(2) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_ratio_falls_back() {
        assert_eq!(aspect_ratio_filter("not-a-ratio"), FALLBACK_FILTER);
        assert_eq!(aspect_ratio_filter("16:0"), FALLBACK_FILTER);
        assert_eq!(aspect_ratio_filter("-16:9"), FALLBACK_FILTER);
    }

    #[test]
    fn landscape_targets_width_1920() {
        let filter = aspect_ratio_filter("16:9");
        assert!(filter.starts_with("scale=1920:-2"));
        assert!(filter.contains("pad=1920:1080:"));
    }

    #[test]
    fn portrait_targets_height_1920() {
        let filter = aspect_ratio_filter("9:16");
        assert!(filter.contains("pad=1080:1920:"));
    }

    #[test]
    fn square_ratio_targets_both_dimensions_equal() {
        let filter = aspect_ratio_filter("1:1");
        assert!(filter.contains("pad=1920:1920:"));
    }

    #[test]
    fn computed_dimensions_are_always_even_and_at_least_two() {
        for ratio in ["21:9", "4:3", "3:4", "1:3", "37:11"] {
            let filter = aspect_ratio_filter(ratio);
            let dims = extract_pad_dims(&filter);
            if let Some((w, h)) = dims {
                assert!(w % 2 == 0 && w >= 2);
                assert!(h % 2 == 0 && h >= 2);
            }
        }
    }

    fn extract_pad_dims(filter: &str) -> Option<(u32, u32)> {
        let pad = filter.split("pad=").nth(1)?;
        let dims = pad.split(':').take(2).collect::<Vec<_>>();
        let w: u32 = dims.first()?.parse().ok()?;
        let h: u32 = dims.get(1)?.parse().ok()?;
        Some((w, h))
    }
}
