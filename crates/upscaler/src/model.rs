use serde::{Deserialize, Serialize};

/// Supported Real-ESRGAN model variants.
///
/// Each variant maps to one model file shipped with the upscaling tool and
/// carries the fixed set of scale factors that model was trained for. Unknown
/// model names and unsupported (model, scale) pairs are rejected at batch
/// submission, not when the tool eventually fails downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpscaleModel {
    RealEsrganX4Plus,
    RealEsrganX4PlusAnime,
    RealEsrnetX4Plus,
    RealEsrAnimeVideoV3,
}

impl UpscaleModel {
    pub const ALL: [UpscaleModel; 4] = [
        UpscaleModel::RealEsrganX4Plus,
        UpscaleModel::RealEsrganX4PlusAnime,
        UpscaleModel::RealEsrnetX4Plus,
        UpscaleModel::RealEsrAnimeVideoV3,
    ];

    /// Resolve a client-supplied model name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "realesrgan-x4plus" => Some(UpscaleModel::RealEsrganX4Plus),
            "realesrgan-x4plus-anime" => Some(UpscaleModel::RealEsrganX4PlusAnime),
            "realesrnet-x4plus" => Some(UpscaleModel::RealEsrnetX4Plus),
            "realesr-animevideov3" => Some(UpscaleModel::RealEsrAnimeVideoV3),
            _ => None,
        }
    }

    /// Get the model name passed to the upscaling tool via `-n`
    pub fn model_name(&self) -> &'static str {
        match self {
            UpscaleModel::RealEsrganX4Plus => "realesrgan-x4plus",
            UpscaleModel::RealEsrganX4PlusAnime => "realesrgan-x4plus-anime",
            UpscaleModel::RealEsrnetX4Plus => "realesrnet-x4plus",
            UpscaleModel::RealEsrAnimeVideoV3 => "realesr-animevideov3",
        }
    }

    /// Scale factors this model was trained for
    pub fn supported_scales(&self) -> &'static [u32] {
        match self {
            UpscaleModel::RealEsrganX4Plus
            | UpscaleModel::RealEsrganX4PlusAnime
            | UpscaleModel::RealEsrnetX4Plus => &[4],
            UpscaleModel::RealEsrAnimeVideoV3 => &[2, 3, 4],
        }
    }

    pub fn supports_scale(&self, scale: u32) -> bool {
        self.supported_scales().contains(&scale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_round_trip() {
        for model in UpscaleModel::ALL {
            assert_eq!(UpscaleModel::from_name(model.model_name()), Some(model));
        }
    }

    #[test]
    fn test_unknown_name_rejected() {
        assert_eq!(UpscaleModel::from_name("esrgan-old"), None);
        assert_eq!(UpscaleModel::from_name(""), None);
        assert_eq!(UpscaleModel::from_name("REALESRGAN-X4PLUS"), None);
    }

    #[test]
    fn test_x4plus_only_supports_scale_4() {
        let model = UpscaleModel::RealEsrganX4Plus;
        assert!(model.supports_scale(4));
        assert!(!model.supports_scale(2));
        assert!(!model.supports_scale(3));
        assert_eq!(model.supported_scales(), &[4]);
    }

    #[test]
    fn test_anime_video_supports_multiple_scales() {
        let model = UpscaleModel::RealEsrAnimeVideoV3;
        for scale in [2, 3, 4] {
            assert!(model.supports_scale(scale));
        }
        assert!(!model.supports_scale(1));
        assert!(!model.supports_scale(8));
    }
}
