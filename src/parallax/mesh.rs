use bytemuck::{Pod, Zeroable};

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct PlaneVertex {
    /// Plane space, [-1, 1]², +y up.
    pub position: [f32; 2],
    /// [0, 1]², +v down.
    pub uv: [f32; 2],
}

impl PlaneVertex {
    pub const ATTRIBUTES: [wgpu::VertexAttribute; 2] =
        wgpu::vertex_attr_array![0 => Float32x2, 1 => Float32x2];

    pub fn layout() -> wgpu::VertexBufferLayout<'static> {
        wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<PlaneVertex>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &Self::ATTRIBUTES,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlaneMesh {
    pub vertices: Vec<PlaneVertex>,
    pub indices: Vec<u32>,
}

/// Regular grid with `subdivisions` cells per axis, counter-clockwise faces.
pub fn subdivided_plane(subdivisions: u32) -> PlaneMesh {
    let n = subdivisions.max(1);
    let row = n + 1;
    let mut vertices = Vec::with_capacity((row * row) as usize);
    for j in 0..=n {
        let v = j as f32 / n as f32;
        for i in 0..=n {
            let u = i as f32 / n as f32;
            vertices.push(PlaneVertex {
                position: [u * 2.0 - 1.0, 1.0 - v * 2.0],
                uv: [u, v],
            });
        }
    }

    let mut indices = Vec::with_capacity((n * n * 6) as usize);
    for j in 0..n {
        for i in 0..n {
            let top_left = j * row + i;
            let top_right = top_left + 1;
            let bottom_left = top_left + row;
            let bottom_right = bottom_left + 1;
            indices.extend_from_slice(&[
                top_left,
                bottom_left,
                top_right,
                top_right,
                bottom_left,
                bottom_right,
            ]);
        }
    }
    PlaneMesh { vertices, indices }
}
