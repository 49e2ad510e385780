// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! A simple example executable that inspects and produces banana streams to
//! demonstrate the library's features.

use std::env;
use std::error::Error;
use std::fs::File;
use std::io::{stdin, stdout, Read, Write};
use std::process::exit;

use serde_json as json;
use banana_jelly as banana;
use banana::tokens::tokens_from_slice;
use banana::{Decoder, Encoder, JellyOptions, UnjellyOptions};

fn main() -> Result<(), Box<dyn Error>> {
    let args = env::args().collect::<Vec<_>>();
    if args.len() < 2 {
        println!("Usage: banana (tokens | decode | transcode | to_json | from_json) [filename]");
        println!("");
        println!("Input is either given file or stdin.");
        println!("tokens:    list the raw tokens");
        println!("decode:    decode and display jelly objects");
        println!("transcode: decode and re-encode jelly objects");
        println!("to_json:   decode and jsonify jelly objects");
        println!("from_json: encode a jelly object from json");
        exit(1);
    }

    let mut reader: Box<dyn Read> = if args.len() == 3 {
        Box::new(File::open(&args[2])?)
    } else {
        Box::new(stdin())
    };
    let mut input = Vec::new();
    reader.read_to_end(&mut input)?;

    match &*args[1] {
        "tokens" => {
            for token in tokens_from_slice(&input)? {
                println!("{:?}", token);
            }
        },
        "decode" => {
            for object in Decoder::new(UnjellyOptions::new()).feed(&input)? {
                match object {
                    Ok(graph) => println!("{}", graph),
                    Err(e) => println!("rejected: {}", e),
                }
            }
        },
        "transcode" => {
            let mut encoder = Encoder::new(JellyOptions::new());
            for object in Decoder::new(UnjellyOptions::new()).feed(&input)? {
                encoder.encode(&object?)?;
            }
            stdout().write_all(&encoder.take_output())?;
        },
        "to_json" => {
            for object in Decoder::new(UnjellyOptions::new()).feed(&input)? {
                println!("{}", json::to_string_pretty(&object?)?);
            }
        },
        "from_json" => {
            let decoded: json::Value = json::from_slice(&input)?;
            let graph = banana::to_graph(&decoded)?;
            stdout().write_all(&banana::jelly_to_vec(&graph, &JellyOptions::new())?)?;
        }
        _ => {
            println!("No such subcommand.");
            exit(1);
        }
    }
    Ok(())
}
