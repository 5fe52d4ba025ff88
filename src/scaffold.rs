//! Minimal boilerplate synthesized when a submission omits it.

use crate::state::SessionKind;

const BUILD_PUBSPEC: &str = r#"name: preview_app
description: Preview build
publish_to: "none"
version: 1.0.0+1

environment:
  sdk: ">=3.0.0 <4.0.0"

dependencies:
  flutter:
    sdk: flutter

flutter:
  uses-material-design: true
"#;

const BUILD_MAIN: &str = r#"import 'package:flutter/material.dart';

void main() => runApp(const MaterialApp(home: Scaffold(body: Center(child: Text('Hello')))));
"#;

const BUILD_INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
  <base href="$FLUTTER_BASE_HREF">
  <meta charset="UTF-8">
  <title>preview</title>
</head>
<body>
  <script src="flutter_bootstrap.js" async></script>
</body>
</html>
"#;

const SERVICE_PUBSPEC: &str = r#"name: preview_service
publish_to: "none"
version: 1.0.0

environment:
  sdk: ">=3.0.0 <4.0.0"

dependencies:
  shelf: ^1.4.0
  shelf_router: ^1.1.0
"#;

const SERVICE_MAIN: &str = r#"import 'dart:io';

import 'package:shelf/shelf.dart';
import 'package:shelf/shelf_io.dart' as io;
import 'package:shelf_router/shelf_router.dart';

Future<void> main() async {
  final router = Router()..get('/api/health', (Request _) => Response.ok('ok'));
  final port = int.parse(Platform.environment['PORT'] ?? '8080');
  await io.serve(router.call, InternetAddress.anyIPv4, port);
}
"#;

/// Files the toolchain needs for a session kind, with their defaults.
pub fn required_files(kind: SessionKind) -> &'static [(&'static str, &'static str)] {
    match kind {
        SessionKind::Build => &[
            ("pubspec.yaml", BUILD_PUBSPEC),
            ("lib/main.dart", BUILD_MAIN),
            ("web/index.html", BUILD_INDEX_HTML),
        ],
        SessionKind::Run => &[
            ("pubspec.yaml", SERVICE_PUBSPEC),
            ("bin/server.dart", SERVICE_MAIN),
        ],
    }
}
