use std::error::Error;

use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use opgraph_autograd::backprop;
use opgraph_core::backend::{Backend, HostTensor};
use opgraph_core::{
    AttrMap, AutoBroadcastSpec, AutoBroadcastType, DType, Dimension, Graph, IrError, OpKind,
    Output, PartialShape, Shape,
};
use opgraph_cpu::CpuBackend;
use opgraph_ops::{
    add_constant, add_op, add_parameter, broadcast, node_broadcast_axes, shape_constant,
};

type CliResult<T> = std::result::Result<T, Box<dyn Error>>;

#[derive(Parser)]
#[command(name = "opgraph")]
#[command(about = "opgraph development CLI")]
struct Args {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Resolve a broadcast of ARG to TARGET and print the result type.
    ///
    /// Shapes are comma separated dims; `?` is an unknown dim and `*` an
    /// unknown rank. Unknown target dims are fed through a concat of
    /// single-element inputs.
    Resolve {
        /// none (explicit), numpy, pdpd or bidirectional.
        #[arg(long, default_value = "numpy")]
        mode: String,
        #[arg(long)]
        arg: String,
        #[arg(long)]
        target: String,
        /// PDPD start axis; -1 aligns right.
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        axis: i64,
        /// Explicit axes mapping, comma separated.
        #[arg(long)]
        axes: Option<String>,
    },
    /// Build, differentiate and run a small broadcast graph on the CPU backend.
    Smoke,
    /// Dump a broadcast op's attributes as JSON and rebuild it from them.
    Attrs {
        #[arg(long, default_value = "numpy")]
        mode: String,
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        axis: i64,
    },
}

fn main() -> CliResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    match args.cmd {
        Cmd::Resolve {
            mode,
            arg,
            target,
            axis,
            axes,
        } => resolve(&mode, &arg, &target, axis, axes.as_deref()),
        Cmd::Smoke => smoke(),
        Cmd::Attrs { mode, axis } => attrs(&mode, axis),
    }
}

fn parse_spec(mode: &str, axis: i64) -> CliResult<AutoBroadcastSpec> {
    let kind: AutoBroadcastType = mode.parse()?;
    Ok(AutoBroadcastSpec { kind, axis })
}

fn parse_shape(text: &str) -> CliResult<PartialShape> {
    let text = text.trim();
    if text == "*" {
        return Ok(PartialShape::dynamic());
    }
    if text.is_empty() {
        return Ok(PartialShape::new(Vec::new()));
    }
    text.split(',')
        .map(|d| -> CliResult<Dimension> {
            match d.trim() {
                "?" => Ok(Dimension::Dynamic),
                d => Ok(Dimension::Static(d.parse::<usize>()?)),
            }
        })
        .collect::<CliResult<Vec<_>>>()
        .map(PartialShape::new)
}

fn parse_axes(text: &str) -> CliResult<Vec<i64>> {
    text.split(',')
        .filter(|a| !a.trim().is_empty())
        .map(|a| -> CliResult<i64> { Ok(a.trim().parse::<i64>()?) })
        .collect()
}

/// A producer of `target`: a literal when fully known, a concat of
/// single-element inputs when only the rank is known, an opaque parameter
/// otherwise.
fn target_producer(graph: &mut Graph, target: &PartialShape) -> CliResult<Output> {
    let Some(dims) = target.dims() else {
        let opaque = add_parameter(
            graph,
            DType::I64,
            PartialShape::new(vec![Dimension::Dynamic]),
        )?;
        return Ok(opaque.into());
    };
    if let Some(shape) = target.to_shape() {
        return Ok(shape_constant(graph, shape.dims())?.into());
    }
    let mut parts: Vec<Output> = Vec::with_capacity(dims.len());
    for dim in dims {
        let part = match dim {
            Dimension::Static(d) => shape_constant(graph, &[*d])?,
            Dimension::Dynamic => add_parameter(graph, DType::I64, Shape::new(vec![1]))?,
        };
        parts.push(part.into());
    }
    Ok(add_op(graph, OpKind::Concat { axis: 0 }, &parts)?.into())
}

fn resolve(mode: &str, arg: &str, target: &str, axis: i64, axes: Option<&str>) -> CliResult<()> {
    let spec = parse_spec(mode, axis)?;
    let arg_shape = parse_shape(arg)?;
    let target_shape = parse_shape(target)?;

    let mut g = Graph::new();
    let x = add_parameter(&mut g, DType::F32, arg_shape.clone())?;
    let t = target_producer(&mut g, &target_shape)?;
    let mut inputs = vec![x.into(), t];
    if let Some(axes) = axes {
        let mapping = parse_axes(axes)?;
        let m = add_constant(&mut g, DType::I64, Shape::new(vec![mapping.len()]), mapping)?;
        inputs.push(m.into());
    }
    debug!(%spec, arg = %arg_shape, target = %target_shape, "resolve");

    let b = match add_op(&mut g, OpKind::BroadcastV3 { spec }, &inputs) {
        Ok(b) => b,
        Err(e @ IrError::Validation { .. }) => {
            println!("invalid: {e}");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    println!("arg:    {arg_shape}");
    println!("target: {target_shape}");
    println!("mode:   {spec}");
    println!("result: {}", g.meta(b.into())?.shape);
    match node_broadcast_axes(&g, b)? {
        Some(axes) => println!("axes:   {axes:?}"),
        None => println!("axes:   unknown"),
    }
    Ok(())
}

fn smoke() -> CliResult<()> {
    let backend = CpuBackend;
    println!("Backend: {}\n", backend.name());

    // y = broadcast(x, [2, 3]) + b
    let mut g = Graph::new();
    let x = add_parameter(&mut g, DType::F32, Shape::new(vec![3]))?;
    let bias = add_parameter(&mut g, DType::F32, Shape::new(vec![2, 3]))?;
    let t = shape_constant(&mut g, &[2, 3])?;
    let bx = broadcast(&mut g, x.into(), t.into(), AutoBroadcastSpec::numpy())?;
    let y = add_op(&mut g, OpKind::Add, &[bx.into(), bias.into()])?;
    println!("y: {}", g.meta(y.into())?);

    let exe = backend.compile(&g, &[x, bias], &[y.into()])?;
    let out = exe.execute(&[
        HostTensor::from_f32(&[1.0, 2.0, 3.0], &Shape::new(vec![3]))?,
        HostTensor::from_f32(
            &[10.0, 20.0, 30.0, 40.0, 50.0, 60.0],
            &Shape::new(vec![2, 3]),
        )?,
    ])?;
    println!("broadcast([1,2,3]) + bias = {:?}", out[0].data);

    let seed = add_parameter(&mut g, DType::F32, Shape::new(vec![2, 3]))?;
    let adjoints = backprop(&mut g, y.into(), seed.into())?;
    let dx = adjoints.get(x.into()).ok_or("no delta reached x")?;
    println!("dx: {}", g.meta(dx)?);

    let exe = backend.compile(&g, &[seed], &[dx])?;
    let grad = exe.execute(&[HostTensor::from_f32(
        &[1.0, 1.0, 1.0, 1.0, 1.0, 1.0],
        &Shape::new(vec![2, 3]),
    )?])?;
    println!("dx for unit seed = {:?}", grad[0].data);

    println!("\nSmoke test passed.");
    Ok(())
}

fn attrs(mode: &str, axis: i64) -> CliResult<()> {
    let op = OpKind::BroadcastV3 {
        spec: parse_spec(mode, axis)?,
    };
    let json = AttrMap::of(&op).to_json()?;
    let value: serde_json::Value = serde_json::from_str(&json)?;
    println!("{}:\n{}", op.type_info(), serde_json::to_string_pretty(&value)?);
    let rebuilt = OpKind::from_attributes(op.type_info(), &AttrMap::from_json(&json)?)?;
    println!("round trip: {}", if rebuilt == op { "ok" } else { "mismatch" });
    Ok(())
}
