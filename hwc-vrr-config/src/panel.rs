pub const DEFAULT_SYSFS_ROOT: &str = "/sys/devices/platform/exynos-drm/primary-panel";

#[derive(knuffel::Decode, Debug, Clone, PartialEq)]
pub struct Panel {
    #[knuffel(child, unwrap(argument), default = String::from("primary-panel"))]
    pub name: String,
    /// Directory holding the panel's sysfs control nodes.
    #[knuffel(child, unwrap(argument), default = String::from(DEFAULT_SYSFS_ROOT))]
    pub sysfs_root: String,
    /// The panel exposes a writable `te2_rate_hz` node.
    #[knuffel(child)]
    pub te2_changeable: bool,
    /// Frames the DDIC inserts per presented frame while dozing.
    #[knuffel(child, unwrap(argument), default = 2)]
    pub ddic_frame_insertion_multiplier: u32,
}

impl Default for Panel {
    fn default() -> Self {
        Self {
            name: String::from("primary-panel"),
            sysfs_root: String::from(DEFAULT_SYSFS_ROOT),
            te2_changeable: false,
            ddic_frame_insertion_multiplier: 2,
        }
    }
}
