//! Fixed shaders behind `draw` and `dispatch`.

use windows::core::{s, PCSTR};
use windows::Win32::Graphics::Direct3D::Fxc::{D3DCompile, D3DCOMPILE_OPTIMIZATION_LEVEL3};
use windows::Win32::Graphics::Direct3D::ID3DBlob;
use windows::Win32::Graphics::Direct3D11::{
    ID3D11ComputeShader, ID3D11DepthStencilState, ID3D11Device, ID3D11InputLayout,
    ID3D11PixelShader, ID3D11RasterizerState, ID3D11VertexShader, D3D11_COMPARISON_LESS,
    D3D11_CULL_NONE, D3D11_DEPTH_STENCIL_DESC, D3D11_DEPTH_WRITE_MASK_ALL, D3D11_FILL_SOLID,
    D3D11_INPUT_ELEMENT_DESC, D3D11_INPUT_PER_VERTEX_DATA, D3D11_RASTERIZER_DESC,
};
use windows::Win32::Graphics::Dxgi::Common::DXGI_FORMAT_R32G32B32A32_FLOAT;

use crate::{DriverError, DriverResult};

const TRIANGLE_SOURCE: &str = r#"
struct VsIn { float4 pos : POSITION; float4 color : COLOR; };
struct VsOut { float4 pos : SV_Position; float4 color : COLOR; };
VsOut vs_main(VsIn input) { VsOut o; o.pos = input.pos; o.color = input.color; return o; }
float4 ps_main(VsOut input) : SV_Target { return input.color; }
"#;

const FILL_SOURCE: &str = r#"
cbuffer Params : register(b0) { uint value; uint count; uint2 pad; };
RWByteAddressBuffer output : register(u0);
[numthreads(64, 1, 1)]
void cs_main(uint3 id : SV_DispatchThreadID) {
    if (id.x < count) { output.Store(id.x * 4, value); }
}
"#;

/// Threads per group of the fill compute shader.
pub(crate) const FILL_GROUP_SIZE: u64 = 64;

/// One vertex of the triangle pipeline.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct Vertex {
    pub position: [f32; 4],
    pub color: [f32; 4],
}

/// Constant buffer of the fill compute shader.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct FillParams {
    pub value: u32,
    pub count: u32,
    pub pad: [u32; 2],
}

pub(crate) struct Pipeline {
    pub vertex_shader: ID3D11VertexShader,
    pub pixel_shader: ID3D11PixelShader,
    pub input_layout: ID3D11InputLayout,
    pub rasterizer: ID3D11RasterizerState,
    pub depth_less: ID3D11DepthStencilState,
    pub fill_shader: ID3D11ComputeShader,
}

fn compile(source: &str, entry: PCSTR, target: PCSTR) -> DriverResult<ID3DBlob> {
    let mut code = None;
    let mut errors = None;
    let result = unsafe {
        D3DCompile(
            source.as_ptr().cast(),
            source.len(),
            None,
            None,
            None,
            entry,
            target,
            D3DCOMPILE_OPTIMIZATION_LEVEL3,
            0,
            &mut code,
            Some(&mut errors),
        )
    };
    if let Err(e) = result {
        let message = errors
            .map(|blob: ID3DBlob| unsafe {
                let bytes = std::slice::from_raw_parts(
                    blob.GetBufferPointer() as *const u8,
                    blob.GetBufferSize(),
                );
                String::from_utf8_lossy(bytes).into_owned()
            })
            .unwrap_or_else(|| e.message().to_string());
        return Err(DriverError::WindowsApi {
            message: format!("shader compilation failed: {message}"),
            source: Some(e),
        });
    }
    code.ok_or_else(|| DriverError::WindowsApi {
        message: "D3DCompile returned no code".to_string(),
        source: None,
    })
}

fn bytecode(blob: &ID3DBlob) -> &[u8] {
    unsafe { std::slice::from_raw_parts(blob.GetBufferPointer() as *const u8, blob.GetBufferSize()) }
}

fn created<T>(object: Option<T>, what: &str) -> DriverResult<T> {
    object.ok_or_else(|| DriverError::WindowsApi {
        message: format!("Failed to create {what}"),
        source: None,
    })
}

impl Pipeline {
    pub fn new(device: &ID3D11Device) -> DriverResult<Self> {
        let vs_blob = compile(TRIANGLE_SOURCE, s!("vs_main"), s!("vs_5_0"))?;
        let ps_blob = compile(TRIANGLE_SOURCE, s!("ps_main"), s!("ps_5_0"))?;
        let cs_blob = compile(FILL_SOURCE, s!("cs_main"), s!("cs_5_0"))?;

        let elements = [
            D3D11_INPUT_ELEMENT_DESC {
                SemanticName: s!("POSITION"),
                SemanticIndex: 0,
                Format: DXGI_FORMAT_R32G32B32A32_FLOAT,
                InputSlot: 0,
                AlignedByteOffset: 0,
                InputSlotClass: D3D11_INPUT_PER_VERTEX_DATA,
                InstanceDataStepRate: 0,
            },
            D3D11_INPUT_ELEMENT_DESC {
                SemanticName: s!("COLOR"),
                SemanticIndex: 0,
                Format: DXGI_FORMAT_R32G32B32A32_FLOAT,
                InputSlot: 0,
                AlignedByteOffset: 16,
                InputSlotClass: D3D11_INPUT_PER_VERTEX_DATA,
                InstanceDataStepRate: 0,
            },
        ];

        let mut vertex_shader = None;
        let mut pixel_shader = None;
        let mut fill_shader = None;
        let mut input_layout = None;
        let mut rasterizer = None;
        let mut depth_less = None;
        unsafe {
            device.CreateVertexShader(bytecode(&vs_blob), None, Some(&mut vertex_shader))?;
            device.CreatePixelShader(bytecode(&ps_blob), None, Some(&mut pixel_shader))?;
            device.CreateComputeShader(bytecode(&cs_blob), None, Some(&mut fill_shader))?;
            device.CreateInputLayout(&elements, bytecode(&vs_blob), Some(&mut input_layout))?;
            device.CreateRasterizerState(
                &D3D11_RASTERIZER_DESC {
                    FillMode: D3D11_FILL_SOLID,
                    CullMode: D3D11_CULL_NONE,
                    DepthClipEnable: true.into(),
                    ..Default::default()
                },
                Some(&mut rasterizer),
            )?;
            device.CreateDepthStencilState(
                &D3D11_DEPTH_STENCIL_DESC {
                    DepthEnable: true.into(),
                    DepthWriteMask: D3D11_DEPTH_WRITE_MASK_ALL,
                    DepthFunc: D3D11_COMPARISON_LESS,
                    ..Default::default()
                },
                Some(&mut depth_less),
            )?;
        }

        Ok(Self {
            vertex_shader: created(vertex_shader, "vertex shader")?,
            pixel_shader: created(pixel_shader, "pixel shader")?,
            input_layout: created(input_layout, "input layout")?,
            rasterizer: created(rasterizer, "rasterizer state")?,
            depth_less: created(depth_less, "depth-stencil state")?,
            fill_shader: created(fill_shader, "compute shader")?,
        })
    }
}
