use crate::{common::*, config::JointMode};

/// Renders one map per joint. Joints with a negative coordinate are missing and
/// leave their map empty.
pub fn joint_maps(
    joints: &[[f32; 2]],
    num_joints: usize,
    height: usize,
    width: usize,
    mode: JointMode,
    radius: f32,
) -> Array3<f32> {
    let mut maps = Array3::<f32>::zeros((num_joints, height, width));

    joints
        .iter()
        .take(num_joints)
        .enumerate()
        .filter(|(_, [x, y])| *x >= 0.0 && *y >= 0.0)
        .for_each(|(index, &[jx, jy])| {
            let mut map = maps.index_axis_mut(Axis(0), index);
            map.indexed_iter_mut().for_each(|((y, x), value)| {
                let dx = x as f32 - jx;
                let dy = y as f32 - jy;
                let dist2 = dx * dx + dy * dy;
                *value = match mode {
                    JointMode::Binary => {
                        if dist2 <= radius * radius {
                            1.0
                        } else {
                            0.0
                        }
                    }
                    JointMode::Gaussian => (-dist2 / (2.0 * radius * radius)).exp(),
                };
            });
        });

    maps
}
