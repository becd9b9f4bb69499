use clap::Parser as ClapParser;
use std::process;

use valdi_bridge::{
    BridgeResult, ExportedRef, GetMapPropertyFlags, Marshaller, Strength, Strong,
    TaggedValue, intern, strong_references, weak_references,
};

#[derive(Debug)]
struct DemoView {
    id: usize,
}

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Number of native objects to export
    #[arg(long, default_value_t = 8, help = "Objects to export through the table")]
    objects: usize,

    /// Export through the weak table instead of the strong one
    #[arg(long, help = "Use the weak reference table")]
    weak: bool,

    /// Indent the marshaller rendering
    #[arg(long, help = "Pretty print the sample marshaller")]
    indent: bool,

    /// Log at debug level regardless of RUST_LOG
    #[arg(long, short)]
    verbose: bool,
}

fn export_objects(cli: &Cli) -> Vec<(Strong, ExportedRef)> {
    let strength = if cli.weak {
        Strength::Weak
    } else {
        Strength::Strong
    };
    let mut exported: Vec<_> = (0..cli.objects)
        .map(|id| {
            let view = Strong::new(DemoView { id }).erase();
            let tag = if id % 3 == 0 { "Label" } else { "View" };
            let reference = ExportedRef::export(&view, strength, tag);
            (view, reference)
        })
        .collect();

    // release every other one, their slots go back to the free list
    let mut index = 0;
    exported.retain(|_| {
        index += 1;
        index % 2 == 1
    });
    exported
}

fn sample(marshaller: &mut Marshaller, exported: &[(Strong, ExportedRef)]) -> BridgeResult<()> {
    let root = marshaller.push_map(3);
    marshaller.push_string("valdi-bridge");
    marshaller.put_map_property(root, &intern("name"), -1)?;

    let views = marshaller.push_array(exported.len());
    for (item, (view, reference)) in exported.iter().enumerate() {
        let entry = marshaller.push_map(2);
        marshaller.push(TaggedValue::Reference(reference.clone()));
        marshaller.put_map_property(entry, &intern("ref"), -1)?;
        let id = view
            .downcast_ref::<DemoView>()
            .map_or(-1, |view| view.id as i64);
        marshaller.push_long(id);
        marshaller.put_map_property(entry, &intern("id"), -1)?;
        marshaller.set_array_item(views, item, entry)?;
    }
    marshaller.put_map_property(root, &intern("views"), views)?;

    if !marshaller.get_map_property(root, intern("views"), GetMapPropertyFlags::empty())? {
        log::warn!("sample map lost its views");
    }
    marshaller.pop()?;
    Ok(())
}

fn run(cli: &Cli) -> BridgeResult<()> {
    let exported = export_objects(cli);

    let stats = if cli.weak {
        weak_references().dump_stats()
    } else {
        strong_references().dump_stats()
    };
    println!("table size: {}", stats.table_size);
    println!("active references: {}", stats.active_references_count);
    for (tag, count) in &stats.active_references_by_tag {
        println!("  {tag}: {count}");
    }

    let mut marshaller = Marshaller::default();
    sample(&mut marshaller, &exported)?;
    println!("{}", marshaller.to_string(0, cli.indent)?);
    marshaller.check_for_error()
}

fn main() {
    let cli = Cli::parse();

    let mut logger = env_logger::Builder::from_default_env();
    if cli.verbose {
        logger.filter_level(log::LevelFilter::Debug);
    }
    logger.init();

    if let Err(error) = run(&cli) {
        eprintln!("error: {error}");
        process::exit(1);
    }
}
