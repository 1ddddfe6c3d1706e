use clap::Parser;
use layout_map::HashTable;
use layout_map::MapLayout;
use layout_map::allocator_api2::alloc::Global;
use layout_map::strategy::Djb2;
use layout_map::strategy::Elf;
use layout_map::strategy::Fnv1a;
use layout_map::strategy::KeyStrategy;
use layout_map::strategy::Sdbm;

#[derive(Parser, Debug)]
struct Args {
    #[arg(short = 'c', long = "target_capacity", default_value_t = 1000)]
    target_capacity: usize,

    /// Byte hash to use: fnv1a, djb2, sdbm, elf or default.
    #[arg(short = 's', long = "strategy", default_value = "default")]
    strategy: String,

    /// Fraction of entries removed after filling, to show tombstones.
    #[arg(short = 'r', long = "remove_fraction", default_value_t = 0.0)]
    remove_fraction: f64,
}

fn run<S: KeyStrategy>(args: &Args, strategy: S) {
    println!(
        "Creating HashTable with target capacity: {}",
        args.target_capacity
    );

    let layout = MapLayout::of::<u64, u64>();
    let mut table = match HashTable::with_capacity_in(layout, args.target_capacity, strategy, Global)
    {
        Ok(table) => table,
        Err(err) => {
            eprintln!("failed to create table: {err}");
            return;
        }
    };

    println!("Actual capacity: {}", table.capacity());
    println!("Filling table with u64 keys...");

    let mut num_failures = 0;
    for i in 0..args.target_capacity as u64 {
        if table.insert(&i.to_ne_bytes(), &(i * 2).to_ne_bytes()).is_err() {
            num_failures += 1;
        }
    }

    let to_remove = (args.target_capacity as f64 * args.remove_fraction) as u64;
    for i in 0..to_remove {
        let _ = table.remove(&i.to_ne_bytes());
    }

    println!("Inserted {} values into table", table.len());
    println!(
        "Final load factor: {:.2}%",
        (table.len() as f64 / table.capacity().max(1) as f64) * 100.0
    );

    table.print_probe_histogram();
    table.debug_stats().print();
    println!("Number of failed insertions: {num_failures}");
}

fn main() {
    let args = Args::parse();

    match args.strategy.as_str() {
        "fnv1a" => run(&args, Fnv1a),
        "djb2" => run(&args, Djb2),
        "sdbm" => run(&args, Sdbm),
        "elf" => run(&args, Elf),
        _ => run(&args, layout_map::DefaultStrategy::default()),
    }
}
