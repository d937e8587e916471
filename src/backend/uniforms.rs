// Builtin uniform block
//
// Per-draw data every shader receives: transform, device projection,
// normal matrix, screen parameters and the constant draw color.

use bytemuck::{Pod, Zeroable};
use glam::{Mat3, Mat4};

use super::state::Color;

/// GPU layout of the builtin uniform block (std140 compatible)
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct BuiltinUniformData {
    pub transform: [f32; 16],
    pub projection: [f32; 16],
    /// Columns of the normal matrix. `[0][3]` carries the DPI scale and
    /// `[1][3]` the point size.
    pub normal_matrix: [[f32; 4]; 3],
    /// (viewport width, viewport height, 1, 0)
    pub screen_size_params: [f32; 4],
    pub constant_color: [f32; 4],
}

/// Inputs for one uniform block
#[derive(Debug, Clone, Copy)]
pub struct UniformInputs {
    pub transform: Mat4,
    pub projection: Mat4,
    pub display_rotation: Mat4,
    pub dpi_scale: f32,
    pub point_size: f32,
    pub viewport: (f32, f32),
    pub color: Color,
    pub gamma_correct: bool,
}

impl BuiltinUniformData {
    pub fn build(inputs: &UniformInputs) -> Self {
        let projection = inputs.display_rotation * inputs.projection;

        // Transpose of the inverse of the upper-left 3x3
        let normal = Mat3::from_mat4(inputs.transform).inverse().transpose();
        let mut normal_matrix = [[0.0f32; 4]; 3];
        for (i, column) in [normal.x_axis, normal.y_axis, normal.z_axis].iter().enumerate() {
            normal_matrix[i] = [column.x, column.y, column.z, 0.0];
        }
        normal_matrix[0][3] = inputs.dpi_scale;
        normal_matrix[1][3] = inputs.point_size;

        let color = if inputs.gamma_correct {
            gamma_to_linear(inputs.color)
        } else {
            inputs.color
        };

        Self {
            transform: inputs.transform.to_cols_array(),
            projection: projection.to_cols_array(),
            normal_matrix,
            screen_size_params: [inputs.viewport.0, inputs.viewport.1, 1.0, 0.0],
            constant_color: color.to_array(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

/// sRGB transfer function to linear, for one channel
pub fn gamma_to_linear_channel(c: f32) -> f32 {
    if c <= 0.04045 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

/// Convert RGB from sRGB to linear; alpha is left alone
pub fn gamma_to_linear(color: Color) -> Color {
    Color::new(
        gamma_to_linear_channel(color.r),
        gamma_to_linear_channel(color.g),
        gamma_to_linear_channel(color.b),
        color.a,
    )
}

/// Top-left origin orthographic projection mapping pixels to clip space
pub fn ortho_projection(width: f32, height: f32) -> Mat4 {
    Mat4::orthographic_rh(0.0, width, height, 0.0, -10.0, 10.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn inputs() -> UniformInputs {
        UniformInputs {
            transform: Mat4::IDENTITY,
            projection: Mat4::IDENTITY,
            display_rotation: Mat4::IDENTITY,
            dpi_scale: 2.0,
            point_size: 3.0,
            viewport: (800.0, 600.0),
            color: Color::new(0.5, 0.5, 0.5, 0.25),
            gamma_correct: false,
        }
    }

    #[test]
    fn layout_is_packed() {
        assert_eq!(std::mem::size_of::<BuiltinUniformData>(), (16 + 16 + 12 + 4 + 4) * 4);
    }

    #[test]
    fn dpi_and_point_size_ride_in_normal_matrix() {
        let data = BuiltinUniformData::build(&inputs());
        assert_eq!(data.normal_matrix[0][3], 2.0);
        assert_eq!(data.normal_matrix[1][3], 3.0);
        assert_eq!(data.normal_matrix[2][3], 0.0);
        assert_eq!(data.screen_size_params, [800.0, 600.0, 1.0, 0.0]);
        assert_eq!(data.constant_color, [0.5, 0.5, 0.5, 0.25]);
    }

    #[test]
    fn normal_matrix_undoes_scale() {
        let mut i = inputs();
        i.transform = Mat4::from_scale(Vec3::new(2.0, 4.0, 1.0));
        let data = BuiltinUniformData::build(&i);
        assert!((data.normal_matrix[0][0] - 0.5).abs() < 1e-6);
        assert!((data.normal_matrix[1][1] - 0.25).abs() < 1e-6);
        assert!((data.normal_matrix[2][2] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn projection_is_composed_with_display_rotation() {
        let mut i = inputs();
        i.projection = ortho_projection(800.0, 600.0);
        i.display_rotation = Mat4::from_rotation_z(-std::f32::consts::FRAC_PI_2);
        let data = BuiltinUniformData::build(&i);
        let expected = (i.display_rotation * i.projection).to_cols_array();
        assert_eq!(data.projection, expected);
    }

    #[test]
    fn gamma_correction_applies_to_rgb_only() {
        let mut i = inputs();
        i.gamma_correct = true;
        let data = BuiltinUniformData::build(&i);
        let expected = ((0.5f32 + 0.055) / 1.055).powf(2.4);
        assert!((data.constant_color[0] - expected).abs() < 1e-6);
        assert_eq!(data.constant_color[3], 0.25);
        assert_eq!(gamma_to_linear_channel(0.0), 0.0);
        assert!((gamma_to_linear_channel(1.0) - 1.0).abs() < 1e-6);
    }
}
