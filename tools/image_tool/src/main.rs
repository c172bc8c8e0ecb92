mod error;
mod keys;

use crate::error::Error;

extern crate clap;
use clap::{clap_app, ArgMatches};

use std::{fs, process};
use swapstone_lib::devices::{
    crypto::encryption::ImageKey,
    image::{
        builder::{header_of, ImageBuilder, KeyReference},
        flags, ImageVersion,
    },
};

/// `major[.minor[.revision]][+build]`
fn parse_version(text: &str) -> Result<ImageVersion, Error> {
    let bad = || Error::BadArgument("version", text.to_owned());
    let (numbers, build) = match text.split_once('+') {
        Some((numbers, build)) => (numbers, build.parse::<u32>().map_err(|_| bad())?),
        None => (text, 0),
    };
    let mut parts = numbers.split('.');
    let mut next = || parts.next().map(str::parse::<u16>).transpose().map_err(|_| bad());
    let major = next()?.ok_or_else(bad)?;
    let minor = next()?.unwrap_or(0);
    let revision = next()?.unwrap_or(0);
    if major > u8::MAX as u16 || minor > u8::MAX as u16 {
        return Err(bad());
    }
    Ok(ImageVersion::new(major as u8, minor as u8, revision, build))
}

/// `image:version`
fn parse_dependency(text: &str) -> Result<(u8, ImageVersion), Error> {
    let (image, version) =
        text.split_once(':').ok_or_else(|| Error::BadArgument("dependency", text.to_owned()))?;
    let image = image.parse::<u8>().map_err(|_| Error::BadArgument("dependency", text.to_owned()))?;
    Ok((image, parse_version(version)?))
}

fn parse_number(name: &'static str, text: &str) -> Result<u32, Error> {
    let parsed = match text.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => text.parse::<u32>(),
    };
    parsed.map_err(|_| Error::BadArgument(name, text.to_owned()))
}

fn run(matches: &ArgMatches) -> Result<String, Error> {
    let input = matches.value_of("input").unwrap_or_default();
    let output = matches.value_of("output").unwrap_or_default();
    let body = fs::read(input).map_err(|_| Error::FileReadFailed(error::File::Input))?;

    let mut builder = ImageBuilder::new(&body);
    if let Some(version) = matches.value_of("image_version") {
        builder = builder.version(parse_version(version)?);
    }
    if let Some(size) = matches.value_of("header_size") {
        let size = parse_number("header size", size)?;
        let size = u16::try_from(size).map_err(|_| Error::BadArgument("header size", size.to_string()))?;
        builder = builder.header_size(size);
    }
    if let Some(address) = matches.value_of("load_address") {
        builder = builder.load_address(parse_number("load address", address)?).flags(flags::RAM_LOAD);
    }
    if let Some(counter) = matches.value_of("security_counter") {
        builder = builder.security_counter(parse_number("security counter", counter)?);
    }
    for dependency in matches.values_of("dependency").into_iter().flatten() {
        let (image, version) = parse_dependency(dependency)?;
        builder = builder.dependency(image, version);
    }
    if matches.is_present("non_bootable") {
        builder = builder.flags(flags::NON_BOOTABLE);
    }
    if let Some(key) = matches.value_of("key") {
        let reference = match matches.value_of("key_reference") {
            None | Some("hash") => KeyReference::Hash,
            Some("embedded") => KeyReference::Embedded,
            Some(other) => return Err(Error::BadArgument("key reference", other.to_owned())),
        };
        builder = builder.sign(keys::read_signing_key(key)?, reference);
    }
    if let Some(recipient) = matches.value_of("encrypt") {
        let image_key = ImageKey::new(keys::random_bytes()?);
        builder = builder.encrypt(keys::read_recipient(recipient)?, keys::ephemeral_key()?, image_key);
    }
    if matches.is_present("primary_only") {
        builder = builder.masking_encrypted_flag();
    }

    let image = builder.build().map_err(Error::Build)?;
    let header = header_of(&image).map_err(Error::Build)?;
    fs::write(output, &image).map_err(|_| Error::FileWriteFailed(error::File::Output))?;

    let version = header.version;
    Ok(format!(
        "Wrote {} ({} bytes): version {}.{}.{}+{}, header {} bytes, body {} bytes, flags {:#010x}.",
        output,
        image.len(),
        version.major,
        version.minor,
        version.revision,
        version.build_num,
        header.header_size,
        header.image_size,
        header.flags
    ))
}

fn main() {
    let matches = clap_app!(app =>
        (name: env!("CARGO_PKG_NAME"))
        (version: env!("CARGO_PKG_VERSION"))
        (about: env!("CARGO_PKG_DESCRIPTION"))
        (@arg input: +required "Raw firmware binary.")
        (@arg output: +required "Where to write the boot image.")
        (@arg image_version: -n --("image-version") +takes_value "Image version, as major.minor.revision+build.")
        (@arg header_size: -H --("header-size") +takes_value "Bytes reserved for the header (default 0x200).")
        (@arg load_address: -l --("load-address") +takes_value "Address the image is copied to before it runs.")
        (@arg security_counter: -s --("security-counter") +takes_value "Rollback counter carried by the image.")
        (@arg dependency: -d --dependency +takes_value +multiple
            "Minimum version of another image, as image:version.")
        (@arg key: -k --key +takes_value "ECDSA P-256 private key to sign with (PKCS#8 PEM).")
        (@arg key_reference: -r --("key-reference") +takes_value
            "How the image names its key: hash (default) or embedded.")
        (@arg encrypt: -e --encrypt +takes_value "Encrypt for the device holding this P-256 public key.")
        (@arg primary_only: --("primary-only") "Hash the header as a primary-only build will see it.")
        (@arg non_bootable: --("non-bootable") "Mark the image as not bootable on its own.")
    )
    .get_matches();

    match run(&matches) {
        Ok(s) => {
            println!("{}", s);
        }
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn versions_parse_with_optional_fields() {
        assert_eq!(parse_version("1").ok(), Some(ImageVersion::new(1, 0, 0, 0)));
        assert_eq!(parse_version("1.2.300+7").ok(), Some(ImageVersion::new(1, 2, 300, 7)));
        assert!(parse_version("256.0").is_err());
        assert!(parse_version("one").is_err());
        assert_eq!(parse_dependency("1:2.5").ok(), Some((1, ImageVersion::new(2, 5, 0, 0))));
        assert_eq!(parse_number("n", "0x200").ok(), Some(0x200));
    }
}
