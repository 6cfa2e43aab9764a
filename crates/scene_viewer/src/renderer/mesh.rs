//! wgpu mesh backend: one flat-shaded pipeline plus the handle table behind
//! `MeshRenderer`. Normals are derived in the fragment shader from screen
//! space derivatives, so meshes carry positions only.

use super::context::{GfxContext, DEPTH_FORMAT};
use super::{MeshDraw, MeshHandle, MeshRenderer};
use glam::Mat4;
use std::collections::HashMap;
use wgpu::util::DeviceExt;

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct MeshUniforms {
    /// Transform from model space to clip space.
    mvp: [[f32; 4]; 4], // 64 B
    /// Base color; w unused.
    color: [f32; 4], // +16 -> 80
}

const _: [(); 80] = [(); core::mem::size_of::<MeshUniforms>()];

struct GpuMesh {
    vtx: wgpu::Buffer,
    idx: wgpu::Buffer,
    index_count: u32,
    ubo: wgpu::Buffer,
    bind: wgpu::BindGroup,
}

pub struct WgpuRenderer {
    pub gfx: GfxContext,
    pipeline: wgpu::RenderPipeline,
    bind_layout: wgpu::BindGroupLayout,
    meshes: HashMap<u64, GpuMesh>,
    next_id: u64,
}

impl WgpuRenderer {
    pub fn new(gfx: GfxContext) -> Self {
        let bind_layout = gfx
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("Mesh BGL"),
                entries: &[wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                }],
            });

        let shader = gfx
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("Mesh WGSL"),
                source: wgpu::ShaderSource::Wgsl(MESH_WGSL.into()),
            });

        let pipeline_layout = gfx
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("Mesh Pipeline Layout"),
                bind_group_layouts: &[&bind_layout],
                push_constant_ranges: &[],
            });

        let pipeline = gfx
            .device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some("Mesh Pipeline"),
                layout: Some(&pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &shader,
                    entry_point: "vs_main",
                    buffers: &[wgpu::VertexBufferLayout {
                        array_stride: std::mem::size_of::<[f32; 3]>() as u64,
                        step_mode: wgpu::VertexStepMode::Vertex,
                        attributes: &[wgpu::VertexAttribute {
                            shader_location: 0,
                            format: wgpu::VertexFormat::Float32x3,
                            offset: 0,
                        }],
                    }],
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                },
                fragment: Some(wgpu::FragmentState {
                    module: &shader,
                    entry_point: "fs_main",
                    targets: &[Some(wgpu::ColorTargetState {
                        format: gfx.config.format,
                        blend: None,
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                }),
                primitive: wgpu::PrimitiveState::default(),
                depth_stencil: Some(wgpu::DepthStencilState {
                    format: DEPTH_FORMAT,
                    depth_write_enabled: true,
                    depth_compare: wgpu::CompareFunction::Less,
                    stencil: wgpu::StencilState::default(),
                    bias: wgpu::DepthBiasState::default(),
                }),
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
            });

        Self {
            gfx,
            pipeline,
            bind_layout,
            meshes: HashMap::new(),
            next_id: 0,
        }
    }

    pub fn resize(&mut self, new_size: winit::dpi::PhysicalSize<u32>) {
        self.gfx.resize(new_size);
    }

    pub fn reconfigure(&self) {
        self.gfx.reconfigure();
    }

    pub fn aspect(&self) -> f32 {
        self.gfx.aspect()
    }

    /// Draw one frame. Draws referencing unknown handles are skipped.
    pub fn render(&mut self, draws: &[MeshDraw], view_proj: Mat4) -> Result<(), wgpu::SurfaceError> {
        let frame = self.gfx.surface.get_current_texture()?;
        let swap_view = frame
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());

        for draw in draws {
            if let Some(mesh) = self.meshes.get(&draw.handle.0) {
                let uniforms = MeshUniforms {
                    mvp: (view_proj * draw.model).to_cols_array_2d(),
                    color: [draw.color.x, draw.color.y, draw.color.z, 1.0],
                };
                self.gfx
                    .queue
                    .write_buffer(&mesh.ubo, 0, bytemuck::bytes_of(&uniforms));
            }
        }

        let mut encoder = self
            .gfx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Frame Encoder"),
            });

        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Mesh Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &swap_view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color {
                            r: 0.10,
                            g: 0.12,
                            b: 0.15,
                            a: 1.0,
                        }),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: &self.gfx.depth_view,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(1.0),
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: None,
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
            });

            pass.set_pipeline(&self.pipeline);
            for draw in draws {
                if let Some(mesh) = self.meshes.get(&draw.handle.0) {
                    pass.set_bind_group(0, &mesh.bind, &[]);
                    pass.set_vertex_buffer(0, mesh.vtx.slice(..));
                    pass.set_index_buffer(mesh.idx.slice(..), wgpu::IndexFormat::Uint32);
                    pass.draw_indexed(0..mesh.index_count, 0, 0..1);
                }
            }
        }

        self.gfx.queue.submit(std::iter::once(encoder.finish()));
        frame.present();
        Ok(())
    }
}

impl MeshRenderer for WgpuRenderer {
    fn upload_mesh(&mut self, positions: &[f32], indices: &[u32]) -> MeshHandle {
        let vtx = self
            .gfx
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Mesh VB"),
                contents: bytemuck::cast_slice(positions),
                usage: wgpu::BufferUsages::VERTEX,
            });
        let idx = self
            .gfx
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Mesh IB"),
                contents: bytemuck::cast_slice(indices),
                usage: wgpu::BufferUsages::INDEX,
            });
        let ubo = self.gfx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Mesh UBO"),
            size: std::mem::size_of::<MeshUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let bind = self.gfx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Mesh Bind Group"),
            layout: &self.bind_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: ubo.as_entire_binding(),
            }],
        });

        self.next_id += 1;
        self.meshes.insert(
            self.next_id,
            GpuMesh {
                vtx,
                idx,
                index_count: indices.len() as u32,
                ubo,
                bind,
            },
        );
        MeshHandle(self.next_id)
    }

    fn destroy_mesh(&mut self, handle: MeshHandle) {
        if let Some(mesh) = self.meshes.remove(&handle.0) {
            mesh.vtx.destroy();
            mesh.idx.destroy();
            mesh.ubo.destroy();
        }
    }
}

const MESH_WGSL: &str = r#"
struct MeshUniforms {
    mvp: mat4x4<f32>,
    color: vec4<f32>,
};
@group(0) @binding(0) var<uniform> U: MeshUniforms;

struct VSOut {
    @builtin(position) clip: vec4<f32>,
    @location(0) local_pos: vec3<f32>,
}

@vertex
fn vs_main(@location(0) pos: vec3<f32>) -> VSOut {
    var out: VSOut;
    out.clip = U.mvp * vec4<f32>(pos, 1.0);
    out.local_pos = pos;
    return out;
}

@fragment
fn fs_main(in: VSOut) -> @location(0) vec4<f32> {
    // Face normal from screen-space derivatives; the meshes carry no normals.
    let n = normalize(cross(dpdx(in.local_pos), dpdy(in.local_pos)));
    let light = clamp(dot(n, normalize(vec3<f32>(0.4, 0.8, 0.45))), 0.0, 1.0);
    return vec4<f32>(U.color.rgb * (0.25 + 0.75 * light), 1.0);
}
"#;
