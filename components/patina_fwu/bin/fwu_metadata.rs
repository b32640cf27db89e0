//! Executable for generating and dumping firmware update metadata.
//!
//! ```text
//! fwu_metadata generate -b 2 -p 2 -i <guid>,<guid> -o metadata.bin
//! fwu_metadata dump metadata.bin
//! ```
//!
//! Image type and location GUIDs that aren't given are generated randomly.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use clap::{Parser, Subcommand};
use patina_fwu::metadata::v2::{MetadataV2, MetadataV2Builder, METADATA_V2_VERSION, V2_MAX_BANKS};
use r_efi::efi;
use std::{
    fs::File,
    io::{self, Read, Write},
    path::PathBuf,
};

#[derive(Parser, Debug)]
struct Args {
    /// Metadata version. Only version 2 is supported.
    #[arg(short, long, default_value_t = METADATA_V2_VERSION)]
    version: u32,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a metadata blob with every image accepted in every bank.
    Generate {
        /// Number of banks.
        #[arg(short, long, default_value_t = 2)]
        banks: u8,
        /// Number of images per bank.
        #[arg(short = 'p', long, default_value_t = 1)]
        img_per_bank: usize,
        /// Image type GUIDs separated by ','.
        #[arg(short, long, value_delimiter = ',')]
        img_type_guid: Vec<uuid::Uuid>,
        /// Location GUIDs separated by ','.
        #[arg(short, long, value_delimiter = ',')]
        location_guid: Vec<uuid::Uuid>,
        /// Path for the output file. If not specified, only the dump is printed.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Dump a metadata blob.
    Dump {
        /// Path for the input file containing the raw metadata.
        input_path: PathBuf,
    },
}

fn main() -> io::Result<()> {
    let args = Args::parse();
    if args.version != METADATA_V2_VERSION {
        eprintln!("Metadata version {} isn't supported.", args.version);
        return Err(io::Error::new(io::ErrorKind::Unsupported, "unsupported metadata version"));
    }

    match args.command {
        Command::Generate { banks, img_per_bank, img_type_guid, location_guid, output } => {
            let blob = generate(banks, img_per_bank, img_type_guid, location_guid)?;
            let metadata = parse(&blob)?;
            println!("Generated Firmware Metadata:");
            print!("{}", metadata);
            if let Some(path) = output {
                File::create(path)?.write_all(&blob)?;
            }
        }
        Command::Dump { input_path } => {
            let mut buffer = Vec::new();
            File::open(input_path)?.read_to_end(&mut buffer)?;
            print!("{}", parse(&buffer)?);
        }
    }
    Ok(())
}

fn generate(
    banks: u8,
    img_per_bank: usize,
    mut image_types: Vec<uuid::Uuid>,
    mut locations: Vec<uuid::Uuid>,
) -> io::Result<Vec<u8>> {
    if image_types.is_empty() {
        image_types = (0..img_per_bank).map(|_| uuid::Uuid::new_v4()).collect();
    }
    if locations.is_empty() {
        locations = (0..img_per_bank).map(|_| uuid::Uuid::new_v4()).collect();
    }
    if image_types.len() < img_per_bank || locations.len() < img_per_bank {
        eprintln!("Expected {} image type and location GUIDs.", img_per_bank);
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "too few GUIDs"));
    }

    let builder = image_types
        .iter()
        .zip(locations.iter())
        .take(img_per_bank)
        .fold(MetadataV2Builder::new(banks), |builder, (image_type, location)| {
            builder.image(to_guid(image_type), to_guid(location))
        });
    builder.build().map_err(|e| {
        eprintln!("Error generating metadata: {}", e);
        io::Error::new(io::ErrorKind::Other, e)
    })
}

fn parse(bytes: &[u8]) -> io::Result<MetadataV2> {
    MetadataV2::parse(bytes, V2_MAX_BANKS as u32).map_err(|e| {
        eprintln!("Error parsing metadata: {}", e);
        io::Error::new(io::ErrorKind::InvalidData, e)
    })
}

fn to_guid(guid: &uuid::Uuid) -> efi::Guid {
    efi::Guid::from_bytes(&guid.to_bytes_le())
}
